//! Recognizers for the action tags an assistant may embed in its reply.
//!
//! Every function here is pure: it reads text and returns intents. Executing an
//! intent (touching memories, calling the image backend, scheduling a task) is the
//! orchestrator's job.

use base64::Engine;
use regex_lite::Regex;
use std::collections::HashMap;
use std::sync::OnceLock;

pub const MAX_IMAGES_PER_TAG: u32 = 10;
pub const DEFAULT_EDIT_STRENGTH: f32 = 0.75;
pub const DEFAULT_SLIDE_WIDTH: u32 = 1024;
pub const DEFAULT_SLIDE_HEIGHT: u32 = 768;
pub const FALLBACK_DIMENSION: u32 = 1024;
const MEMORY_TITLE_CHARS: usize = 30;

/// Result of one recognizer pass over assistant output.
#[derive(Debug, Clone, PartialEq)]
pub struct TagPass<T> {
    pub cleaned: String,
    pub intents: Vec<T>,
    /// `true` when the stored message keeps the tag text verbatim.
    pub keep_original: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MemoryIntent {
    Create { title: String, content: String },
    Update { index: usize, content: String },
    Delete { index: usize },
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenerateIntent {
    pub prompt: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub n: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EditIntent {
    pub prompt: String,
    pub source_index: i64,
    pub strength: f32,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SlideSource {
    Explicit(Vec<String>),
    Topic(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct SlidesIntent {
    pub source: SlideSource,
    pub width: u32,
    pub height: u32,
}

pub(crate) type Pattern = OnceLock<Option<Regex>>;

/// Compiles `pattern` once into `cell`; an invalid pattern is logged and yields `None`.
pub(crate) fn regex(cell: &'static Pattern, pattern: &str) -> Option<&'static Regex> {
    cell.get_or_init(|| match Regex::new(pattern) {
        Ok(re) => Some(re),
        Err(e) => {
            tracing::error!("Invalid pattern {}: {}", pattern, e);
            None
        }
    })
    .as_ref()
}

fn captures<'t>(re: Option<&Regex>, text: &'t str) -> Vec<regex_lite::Captures<'t>> {
    re.map(|re| re.captures_iter(text).collect())
        .unwrap_or_default()
}

fn strip(re: Option<&Regex>, text: &str) -> String {
    match re {
        Some(re) => re.replace_all(text, "").into_owned(),
        None => text.to_string(),
    }
}

fn new_memory_re() -> Option<&'static Regex> {
    static RE: Pattern = OnceLock::new();
    regex(&RE, r"(?is)<new_memory>(.*?)</new_memory>")
}

fn update_memory_re() -> Option<&'static Regex> {
    static RE: Pattern = OnceLock::new();
    regex(&RE, r"(?is)<update_memory:\s*([^>]*?)\s*>(.*?)</update_memory:\s*([^>]*?)\s*>")
}

fn delete_memory_re() -> Option<&'static Regex> {
    static RE: Pattern = OnceLock::new();
    regex(&RE, r"(?is)<delete_memory:\s*([^>]*?)\s*>(.*?)</delete_memory:\s*([^>]*?)\s*>")
}

fn generate_image_re() -> Option<&'static Regex> {
    static RE: Pattern = OnceLock::new();
    regex(&RE, r"(?is)<generate_image\b([^>]*)>(.*?)</generate_image>")
}

fn edit_image_re() -> Option<&'static Regex> {
    static RE: Pattern = OnceLock::new();
    regex(&RE, r"(?is)<edit_image\b([^>]*)>(.*?)</edit_image>")
}

fn generate_slides_re() -> Option<&'static Regex> {
    static RE: Pattern = OnceLock::new();
    regex(&RE, r"(?is)<generate_slides\b([^>]*)>(.*?)</generate_slides>")
}

fn slide_re() -> Option<&'static Regex> {
    static RE: Pattern = OnceLock::new();
    regex(&RE, r"(?is)<slide>(.*?)</slide>")
}

fn attribute_re() -> Option<&'static Regex> {
    static RE: Pattern = OnceLock::new();
    regex(&RE, r#"([A-Za-z_][\w-]*)\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s"'>]+))"#)
}

fn blank_lines_re() -> Option<&'static Regex> {
    static RE: Pattern = OnceLock::new();
    regex(&RE, r"\n{3,}")
}

pub fn parse_attributes(raw: &str) -> HashMap<String, String> {
    captures(attribute_re(), raw)
        .into_iter()
        .filter_map(|caps| {
            let key = caps.get(1)?.as_str().to_ascii_lowercase();
            let value = caps
                .get(2)
                .or_else(|| caps.get(3))
                .or_else(|| caps.get(4))
                .map(|m| m.as_str().trim().to_string())?;
            Some((key, value))
        })
        .collect()
}

fn positive_dimension(attrs: &HashMap<String, String>, key: &str) -> Option<u32> {
    attrs
        .get(key)
        .and_then(|v| v.parse::<u32>().ok())
        .filter(|v| *v > 0)
}

/// Title for an auto-created memory: the first 30 characters plus an ellipsis.
pub fn memory_title(content: &str) -> String {
    let head: String = content.trim().chars().take(MEMORY_TITLE_CHARS).collect();
    format!("{}...", head.trim_end())
}

fn parse_memory_index(raw: &str) -> Option<usize> {
    raw.trim().parse::<usize>().ok().filter(|n| *n >= 1)
}

/// Finds memory tags and strips all of them from the text. Creates come first in the
/// returned intents, then updates and deletes in document order, which is the order
/// they must be applied in.
pub fn parse_memory_tags(content: &str) -> TagPass<MemoryIntent> {
    let mut creates = Vec::new();
    let mut edits = Vec::new();

    for caps in captures(new_memory_re(), content) {
        let text = caps.get(1).map_or("", |m| m.as_str()).trim();
        if text.is_empty() {
            tracing::warn!("Skipping empty <new_memory> tag");
            continue;
        }
        creates.push(MemoryIntent::Create {
            title: memory_title(text),
            content: text.to_string(),
        });
    }

    let mut positioned = Vec::new();
    for caps in captures(update_memory_re(), content) {
        let start = caps.get(0).map_or(0, |m| m.start());
        let open = caps.get(1).map_or("", |m| m.as_str());
        let close = caps.get(3).map_or("", |m| m.as_str());
        let body = caps.get(2).map_or("", |m| m.as_str()).trim();
        match parse_memory_index(open) {
            Some(index) if open.trim() == close.trim() => positioned.push((
                start,
                MemoryIntent::Update {
                    index,
                    content: body.to_string(),
                },
            )),
            _ => tracing::warn!("Skipping malformed <update_memory:{}> tag", open),
        }
    }
    for caps in captures(delete_memory_re(), content) {
        let start = caps.get(0).map_or(0, |m| m.start());
        let open = caps.get(1).map_or("", |m| m.as_str());
        let close = caps.get(3).map_or("", |m| m.as_str());
        match parse_memory_index(open) {
            Some(index) if open.trim() == close.trim() => {
                positioned.push((start, MemoryIntent::Delete { index }))
            }
            _ => tracing::warn!("Skipping malformed <delete_memory:{}> tag", open),
        }
    }
    positioned.sort_by_key(|(start, _)| *start);
    edits.extend(positioned.into_iter().map(|(_, intent)| intent));

    let cleaned = strip(new_memory_re(), content);
    let cleaned = strip(update_memory_re(), &cleaned);
    let cleaned = strip(delete_memory_re(), &cleaned);
    let cleaned = match blank_lines_re() {
        Some(re) => re.replace_all(cleaned.trim(), "\n\n").into_owned(),
        None => cleaned.trim().to_string(),
    };

    creates.extend(edits);
    TagPass {
        cleaned,
        intents: creates,
        keep_original: false,
    }
}

pub fn parse_generate_tags(content: &str) -> TagPass<GenerateIntent> {
    let intents = captures(generate_image_re(), content)
        .into_iter()
        .filter_map(|caps| {
            let attrs = parse_attributes(caps.get(1).map_or("", |m| m.as_str()));
            let prompt = caps.get(2).map_or("", |m| m.as_str()).trim().to_string();
            if prompt.is_empty() {
                tracing::warn!("Skipping <generate_image> tag with empty prompt");
                return None;
            }
            let n = attrs
                .get("n")
                .and_then(|v| v.parse::<i64>().ok())
                .unwrap_or(1)
                .clamp(1, MAX_IMAGES_PER_TAG as i64) as u32;
            Some(GenerateIntent {
                prompt,
                width: positive_dimension(&attrs, "width"),
                height: positive_dimension(&attrs, "height"),
                n,
            })
        })
        .collect();
    TagPass {
        cleaned: content.to_string(),
        intents,
        keep_original: true,
    }
}

pub fn parse_edit_tags(content: &str) -> TagPass<EditIntent> {
    let intents = captures(edit_image_re(), content)
        .into_iter()
        .filter_map(|caps| {
            let attrs = parse_attributes(caps.get(1).map_or("", |m| m.as_str()));
            let prompt = caps.get(2).map_or("", |m| m.as_str()).trim().to_string();
            if prompt.is_empty() {
                tracing::warn!("Skipping <edit_image> tag with empty prompt");
                return None;
            }
            let source_index = attrs
                .get("source_index")
                .and_then(|v| v.parse::<i64>().ok())
                .unwrap_or(-1);
            let strength = attrs
                .get("strength")
                .and_then(|v| v.parse::<f32>().ok())
                .filter(|v| v.is_finite())
                .unwrap_or(DEFAULT_EDIT_STRENGTH)
                .clamp(0.0, 1.0);
            Some(EditIntent {
                prompt,
                source_index,
                strength,
                width: positive_dimension(&attrs, "width"),
                height: positive_dimension(&attrs, "height"),
            })
        })
        .collect();
    TagPass {
        cleaned: content.to_string(),
        intents,
        keep_original: true,
    }
}

pub fn parse_slides_tags(content: &str) -> TagPass<SlidesIntent> {
    let intents = captures(generate_slides_re(), content)
        .into_iter()
        .filter_map(|caps| {
            let attrs = parse_attributes(caps.get(1).map_or("", |m| m.as_str()));
            let inner = caps.get(2).map_or("", |m| m.as_str());
            let slides: Vec<String> = captures(slide_re(), inner)
                .into_iter()
                .filter_map(|s| s.get(1).map(|m| m.as_str().trim().to_string()))
                .filter(|s| !s.is_empty())
                .collect();
            let source = if !slides.is_empty() {
                SlideSource::Explicit(slides)
            } else {
                let topic = inner.trim();
                if topic.is_empty() {
                    tracing::warn!("Skipping <generate_slides> tag with no slides or topic");
                    return None;
                }
                SlideSource::Topic(topic.to_string())
            };
            Some(SlidesIntent {
                source,
                width: positive_dimension(&attrs, "width").unwrap_or(DEFAULT_SLIDE_WIDTH),
                height: positive_dimension(&attrs, "height").unwrap_or(DEFAULT_SLIDE_HEIGHT),
            })
        })
        .collect();
    TagPass {
        cleaned: content.to_string(),
        intents,
        keep_original: true,
    }
}

/// Negative indices count from the end (`-1` is the last image).
pub fn resolve_source_index(index: i64, len: usize) -> Option<usize> {
    let len = len as i64;
    let resolved = if index < 0 { len + index } else { index };
    (0..len).contains(&resolved).then_some(resolved as usize)
}

/// Decoded dimensions of a base64 image, or 1024x1024 when it cannot be read.
pub fn infer_dimensions(base64_image: &str) -> (u32, u32) {
    let payload = crate::image_prep::strip_data_uri(base64_image);
    base64::engine::general_purpose::STANDARD
        .decode(payload.trim())
        .ok()
        .and_then(|bytes| image::load_from_memory(&bytes).ok())
        .map(|img| (img.width(), img.height()))
        .unwrap_or((FALLBACK_DIMENSION, FALLBACK_DIMENSION))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_tags_are_stripped_and_ordered_creates_first() {
        let text = "Sure.\n<delete_memory:2></delete_memory:2>\n\
                    <new_memory>User prefers metric units.</new_memory>\n\
                    <UPDATE_MEMORY:1>Lives in Porto</update_memory:1>\nDone.";
        let pass = parse_memory_tags(text);
        assert!(!pass.keep_original);
        assert_eq!(pass.cleaned, "Sure.\n\nDone.");
        assert_eq!(
            pass.intents,
            vec![
                MemoryIntent::Create {
                    title: "User prefers metric units....".into(),
                    content: "User prefers metric units.".into(),
                },
                MemoryIntent::Delete { index: 2 },
                MemoryIntent::Update {
                    index: 1,
                    content: "Lives in Porto".into(),
                },
            ]
        );
    }

    #[test]
    fn bad_memory_indices_are_skipped_but_stripped() {
        let pass = parse_memory_tags(
            "a<update_memory:zero>x</update_memory:zero>b<delete_memory:0></delete_memory:0>c\
             <update_memory:1>y</update_memory:2>",
        );
        assert!(pass.intents.is_empty());
        assert_eq!(pass.cleaned, "abc");
    }

    #[test]
    fn multiline_memory_bodies_match() {
        let pass = parse_memory_tags("<new_memory>line one\nline two</new_memory>");
        assert_eq!(
            pass.intents,
            vec![MemoryIntent::Create {
                title: "line one\nline two...".into(),
                content: "line one\nline two".into(),
            }]
        );
    }

    #[test]
    fn memory_title_truncates_to_thirty_chars() {
        let title = memory_title("abcdefghijklmnopqrstuvwxyz0123456789");
        assert_eq!(title, "abcdefghijklmnopqrstuvwxyz0123...");
    }

    #[test]
    fn generate_tags_clamp_count_and_keep_text() {
        let text = r#"<generate_image width="512" height="512" n="2">sunset</generate_image>
<generate_image n=0>moon</generate_image><Generate_Image n="99">sea</generate_image>"#;
        let pass = parse_generate_tags(text);
        assert!(pass.keep_original);
        assert_eq!(pass.cleaned, text);
        let counts: Vec<u32> = pass.intents.iter().map(|i| i.n).collect();
        assert_eq!(counts, vec![2, 1, 10]);
        assert_eq!(pass.intents[0].prompt, "sunset");
        assert_eq!(pass.intents[0].width, Some(512));
        assert_eq!(pass.intents[1].width, None);
    }

    #[test]
    fn edit_tags_default_and_clamp() {
        let pass = parse_edit_tags(
            r#"<edit_image source_index="-1">add snow</edit_image>
<edit_image source_index='0' strength="3" width="640">make it night</edit_image>"#,
        );
        assert_eq!(pass.intents.len(), 2);
        assert_eq!(pass.intents[0].source_index, -1);
        assert!((pass.intents[0].strength - 0.75).abs() < f32::EPSILON);
        assert_eq!(pass.intents[1].source_index, 0);
        assert!((pass.intents[1].strength - 1.0).abs() < f32::EPSILON);
        assert_eq!(pass.intents[1].width, Some(640));
        assert_eq!(pass.intents[1].height, None);
    }

    #[test]
    fn slides_accept_list_or_topic() {
        let pass = parse_slides_tags(
            "<generate_slides><Slide>Title card</Slide><slide>Roadmap</slide></generate_slides>\
             <generate_slides width=\"800\">History of tea</generate_slides>\
             <generate_slides>   </generate_slides>",
        );
        assert_eq!(pass.intents.len(), 2);
        assert_eq!(
            pass.intents[0].source,
            SlideSource::Explicit(vec!["Title card".into(), "Roadmap".into()])
        );
        assert_eq!((pass.intents[0].width, pass.intents[0].height), (1024, 768));
        assert_eq!(
            pass.intents[1].source,
            SlideSource::Topic("History of tea".into())
        );
        assert_eq!(pass.intents[1].width, 800);
    }

    #[test]
    fn source_index_resolution_handles_both_ends() {
        assert_eq!(resolve_source_index(-1, 3), Some(2));
        assert_eq!(resolve_source_index(-3, 3), Some(0));
        assert_eq!(resolve_source_index(-4, 3), None);
        assert_eq!(resolve_source_index(0, 3), Some(0));
        assert_eq!(resolve_source_index(3, 3), None);
        assert_eq!(resolve_source_index(-1, 0), None);
    }

    #[test]
    fn infer_dimensions_reads_image_or_falls_back() {
        let img = image::RgbImage::new(40, 30);
        let mut bytes = std::io::Cursor::new(Vec::new());
        image::DynamicImage::ImageRgb8(img)
            .write_to(&mut bytes, image::ImageFormat::Png)
            .unwrap();
        let encoded = base64::engine::general_purpose::STANDARD.encode(bytes.into_inner());
        assert_eq!(infer_dimensions(&encoded), (40, 30));
        assert_eq!(
            infer_dimensions(&format!("data:image/png;base64,{}", encoded)),
            (40, 30)
        );
        assert_eq!(infer_dimensions("not-an-image"), (1024, 1024));
    }
}
