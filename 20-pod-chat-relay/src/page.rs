use maud::{DOCTYPE, Markup, PreEscaped, html};

use crate::identity::PodIdentity;

const CHAT_SCRIPT: &str = r#"
window.onload = function () {
    var conn;
    var msg = document.getElementById("msg");
    var log = document.getElementById("log");

    function appendLog(item) {
        var doScroll = log.scrollTop > log.scrollHeight - log.clientHeight - 1;
        log.appendChild(item);
        if (doScroll) {
            log.scrollTop = log.scrollHeight - log.clientHeight;
        }
    }

    document.getElementById("form").onsubmit = function () {
        if (!conn || !msg.value) {
            return false;
        }
        conn.send(msg.value);
        msg.value = "";
        return false;
    };

    if (window["WebSocket"]) {
        var scheme = document.location.protocol === "https:" ? "wss://" : "ws://";
        conn = new WebSocket(scheme + document.location.host + "/ws");
        conn.onclose = function () {
            var item = document.createElement("div");
            item.innerHTML = "<b>Connection closed.</b>";
            appendLog(item);
        };
        conn.onmessage = function (evt) {
            var messages = evt.data.split('\n');
            for (var i = 0; i < messages.length; i++) {
                var item = document.createElement("div");
                item.innerText = messages[i];
                appendLog(item);
            }
        };
    } else {
        var item = document.createElement("div");
        item.innerHTML = "<b>Your browser does not support WebSockets.</b>";
        appendLog(item);
    }
};
"#;

const CHAT_STYLE: &str = r#"
html, body {
    overflow: hidden;
}

body {
    padding: 0;
    margin: 0;
    width: 100%;
    height: 100%;
    background: gray;
}

#log {
    background: white;
    margin: 0;
    padding: 0.5em;
    position: absolute;
    top: 2.5em;
    left: 0.5em;
    right: 0.5em;
    bottom: 3em;
    overflow: auto;
}

#form {
    padding: 0 0.5em;
    margin: 0;
    position: absolute;
    bottom: 1em;
    left: 0px;
    width: 100%;
    overflow: hidden;
}
"#;

/// Chat page for this pod. The pod name is the only dynamic part and is
/// escaped by the template.
pub fn render(identity: &PodIdentity) -> String {
    page(identity.name()).into_string()
}

fn page(pod_name: &str) -> Markup {
    html! {
        (DOCTYPE)
        html lang="en" {
            head {
                title { "Connected to Pod " (pod_name) }
                script type="text/javascript" { (PreEscaped(CHAT_SCRIPT)) }
                style type="text/css" { (PreEscaped(CHAT_STYLE)) }
            }
            body {
                div {
                    p style="text-align:center" { "Chatting on " (pod_name) }
                }
                div id="log" {}
                form id="form" {
                    input type="submit" value="Send";
                    input type="text" id="msg" size="64";
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_names_the_pod() {
        let page = render(&PodIdentity::resolve(Some("chat-0")));
        assert!(page.starts_with("<!DOCTYPE html>"));
        assert!(page.contains("<title>Connected to Pod chat-0</title>"));
        assert!(page.contains("Chatting on chat-0"));
        assert!(page.contains(r#"new WebSocket(scheme + document.location.host + "/ws")"#));
    }

    #[test]
    fn pod_name_is_escaped() {
        let page = render(&PodIdentity::resolve(Some(r#"<script>alert("x")</script>"#)));
        assert!(!page.contains("<script>alert"));
        assert!(page.contains("&lt;script&gt;alert(&quot;x&quot;)&lt;/script&gt;"));
    }
}
