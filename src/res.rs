use axum::{
    debug_handler,
    extract::Path,
    http::{StatusCode, header},
    response::{Html, IntoResponse, Response},
};

use crate::AppResult;

#[macro_export]
macro_rules! include_res {
    (bytes, $p:expr) => {
        include_bytes!(concat!(env!("CARGO_MANIFEST_DIR"), "/res", $p))
    };
    (str, $p:expr) => {
        include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/res", $p))
    };
}

/// Wraps `body` in the shared layout.
pub fn page(title: &str, body: &str) -> Html<String> {
    Html(
        include_res!(str, "/pages/layout.html")
            .replace("{title}", &escape(title))
            .replace("{body}", body),
    )
}

pub fn not_found(what: &str) -> Html<String> {
    page(
        "Not found",
        &include_res!(str, "/pages/not_found.html").replace("{what}", &escape(what)),
    )
}

pub fn sorry(what: &str) -> AppResult<Response> {
    Ok((StatusCode::NOT_FOUND, not_found(what)).into_response())
}

/// Escapes text for HTML bodies and attributes. Braces are escaped too so
/// user text can never look like a template placeholder.
pub fn escape(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            '{' => escaped.push_str("&#123;"),
            '}' => escaped.push_str("&#125;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

pub fn avatar(url: Option<&str>) -> String {
    match url {
        Some(url) if url.starts_with("https://") => format!(r#"<img class="avatar-img" src="{}" alt="">"#, escape(url)),
        _ => String::new(),
    }
}

#[debug_handler]
pub async fn asset(Path(file): Path<String>) -> Response {
    match file.as_str() {
        "chat.js" => (
            [(header::CONTENT_TYPE, "text/javascript; charset=utf-8")],
            include_res!(str, "/static/chat.js"),
        )
            .into_response(),
        "style.css" => (
            [(header::CONTENT_TYPE, "text/css; charset=utf-8")],
            include_res!(str, "/static/style.css"),
        )
            .into_response(),
        _ => (StatusCode::NOT_FOUND, not_found("file")).into_response(),
    }
}
