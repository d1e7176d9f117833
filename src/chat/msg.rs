use pulldown_cmark::{Event, Options, Parser, Tag, TagEnd};

use crate::{
    include_res,
    platform::{Profile, now_millis},
    res::escape,
};

use super::{ConversationEntry, format, presence::Status, thread::ThreadMessage};

/// Markdown to HTML. Raw HTML in the source is shown as text, and links or
/// images pointing anywhere but http, https or mailto keep only their text.
pub(crate) fn render_content(content: &str) -> String {
    let mut dropped_link = false;
    let mut dropped_image = false;
    let parser = Parser::new_ext(content, Options::ENABLE_STRIKETHROUGH).filter_map(|event| match event {
        Event::Html(html) | Event::InlineHtml(html) => Some(Event::Text(html)),
        Event::Start(Tag::Link { ref dest_url, .. }) if !allowed_destination(dest_url) => {
            dropped_link = true;
            None
        }
        Event::End(TagEnd::Link) if dropped_link => {
            dropped_link = false;
            None
        }
        Event::Start(Tag::Image { ref dest_url, .. }) if !allowed_destination(dest_url) => {
            dropped_image = true;
            None
        }
        Event::End(TagEnd::Image) if dropped_image => {
            dropped_image = false;
            None
        }
        _ => Some(event),
    });

    let mut html = String::new();
    pulldown_cmark::html::push_html(&mut html, parser);
    html.replace('{', "&#123;").replace('}', "&#125;")
}

/// Relative destinations have no scheme and are always fine.
fn allowed_destination(dest: &str) -> bool {
    match dest.split_once(':') {
        Some((scheme, _)) if !scheme.contains(['/', '?', '#']) => ["http", "https", "mailto"]
            .iter()
            .any(|allowed| scheme.eq_ignore_ascii_case(allowed)),
        _ => true,
    }
}

pub(crate) fn message_html(message: &ThreadMessage) -> String {
    include_res!(str, "/pages/chat/message.html")
        .replace("{id}", &message.message.id.to_string())
        .replace("{side}", if message.mine { "mine" } else { "theirs" })
        .replace("{created_at}", &message.message.created_at.to_string())
        .replace("{time}", &format::message_time(message.message.created_at, now_millis()))
        .replace("{initials}", &escape(&message.sender_initials))
        .replace("{name}", &escape(&message.sender_name))
        .replace("{content}", &render_content(&message.message.content))
}

pub(crate) fn conversation_html(entry: &ConversationEntry, status: Status) -> String {
    let (name, initials) = match &entry.other {
        Some(other) => (other.name().to_owned(), other.initials()),
        None => ("Unknown user".to_owned(), "?".to_owned()),
    };
    let preview = entry
        .last_message
        .as_ref()
        .map(|message| message.content.as_str())
        .unwrap_or("No messages yet");
    let now = now_millis();

    include_res!(str, "/pages/chat/conversation_item.html")
        .replace("{id}", &entry.conversation.id.to_string())
        .replace("{other_id}", &entry.other_id.to_string())
        .replace("{status}", status.as_str())
        .replace("{time}", &format::conversation_time(entry.conversation.updated_at, now))
        .replace("{ago}", &format::relative(entry.conversation.updated_at, now))
        .replace("{initials}", &escape(&initials))
        .replace("{name}", &escape(&name))
        .replace("{preview}", &escape(preview))
}

pub(crate) fn header_html(other: &Profile, status: Status) -> String {
    include_res!(str, "/pages/chat/header.html")
        .replace("{other_id}", &other.id.to_string())
        .replace("{status}", status.as_str())
        .replace("{initials}", &escape(&other.initials()))
        .replace("{email}", &escape(&other.email))
        .replace("{name}", &escape(other.name()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn markdown_renders_but_html_does_not() {
        let html = render_content("**hi** <script>alert(1)</script>");
        assert!(html.contains("<strong>hi</strong>"));
        assert!(!html.contains("<script>"));
        assert!(html.contains("&lt;script&gt;"));
    }

    #[test]
    fn script_links_lose_their_target() {
        let html = render_content("[click me](javascript:alert(document.domain))");
        assert_eq!(html.trim(), "<p>click me</p>");

        let html = render_content("<JavaScript:alert(1)> and ![pic](data:text/html;base64,AAAA)");
        assert!(!html.to_lowercase().contains("href=\"javascript"));
        assert!(html.contains("JavaScript:alert(1)"));
        assert!(!html.contains("<img"));
        assert!(html.contains("pic"));
    }

    #[test]
    fn web_and_mail_links_survive() {
        let html = render_content("[docs](https://example.com/a?b=c) [mail](mailto:bob@example.com) [here](/chat)");
        assert!(html.contains(r#"<a href="https://example.com/a?b=c">docs</a>"#));
        assert!(html.contains(r#"<a href="mailto:bob@example.com">mail</a>"#));
        assert!(html.contains(r#"<a href="/chat">here</a>"#));
    }

    #[test]
    fn braces_never_survive() {
        assert!(!render_content("{content}").contains('{'));
    }
}
