//! Paragraph text extraction from HTML pages.

use std::collections::HashSet;

use scraper::{Html, Selector};

/// Join the distinct `<p>` texts of a page, in order of first appearance
///
/// Whitespace inside each paragraph is collapsed; empty paragraphs are
/// skipped. Returns an empty string when nothing usable is found.
pub fn extract_paragraphs(html: &str) -> String {
    let selector = match Selector::parse("p") {
        Ok(selector) => selector,
        Err(_) => return String::new(),
    };
    let document = Html::parse_document(html);

    let mut seen = HashSet::new();
    let mut paragraphs = Vec::new();
    for element in document.select(&selector) {
        let text = collapse_whitespace(&element.text().collect::<String>());
        if !text.is_empty() && seen.insert(text.clone()) {
            paragraphs.push(text);
        }
    }
    paragraphs.join(" ")
}

fn collapse_whitespace(input: &str) -> String {
    let mut buf = String::with_capacity(input.len());
    let mut last_space = false;
    for ch in input.chars() {
        if ch.is_whitespace() {
            if !last_space && !buf.is_empty() {
                buf.push(' ');
            }
            last_space = true;
        } else {
            buf.push(ch);
            last_space = false;
        }
    }
    buf.trim_end().to_string()
}
