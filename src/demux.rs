//! Incremental decoder for the engine's tag-delimited output stream.
//!
//! Output arrives in arbitrarily fragmented chunks. [`Demultiplexer::decode`]
//! turns as much of a [`RawBuffer`] as possible into events and hands back the
//! undecodable remainder, so feeding a stream in one piece or in any number of
//! smaller pieces yields the same event sequence.
//!
//! Each pass over the buffer does one of:
//!
//! 1. drop a single newline that directly precedes `<`,
//! 2. decode one complete tagged unit at the start of the buffer,
//! 3. emit the untagged text in front of the nearest tag (or, with no tag in
//!    sight, every complete line) as `PlainText` events.
//!
//! Decoding stops when a pass makes no progress; whatever is left waits for
//! the next chunk.

use regex::Regex;
use tracing::{debug, warn};

use crate::buffer::RawBuffer;
use crate::classify::{normalize_line, TextClassifier};
use crate::config::ProtocolConfig;
use crate::error::{Result, SessionError};
use crate::events::{Event, PromptKind};

pub const MATH_OPEN: &str = "<mth>";
pub const MATH_CLOSE: &str = "</mth>";
pub const STATUSBAR_OPEN: &str = "<statusbar>";
pub const STATUSBAR_CLOSE: &str = "</statusbar>";

const PID_MARKER: &str = "pid=";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TagKind {
    Prompt,
    Math,
    StatusBar,
    Symbols,
    Variables,
}

#[derive(Debug, Clone)]
struct TagSpec {
    kind: TagKind,
    open: String,
    close: String,
}

/// Outcome of a single pass over the buffer
enum Step {
    Progress,
    NeedMoreInput,
}

/// Decoder for one protocol configuration
#[derive(Debug, Clone)]
pub struct Demultiplexer {
    /// Tags in matching priority order
    tags: Vec<TagSpec>,
    main_prompts: Vec<Regex>,
    classifier: TextClassifier,
    variable: Regex,
}

impl Demultiplexer {
    pub fn new(config: &ProtocolConfig) -> Result<Self> {
        let spec = |kind, open: &str, close: &str| TagSpec {
            kind,
            open: open.to_string(),
            close: close.to_string(),
        };
        let tags = vec![
            spec(TagKind::Prompt, &config.prompt_prefix, &config.prompt_suffix),
            spec(TagKind::Math, MATH_OPEN, MATH_CLOSE),
            spec(TagKind::StatusBar, STATUSBAR_OPEN, STATUSBAR_CLOSE),
            spec(TagKind::Symbols, &config.symbols_prefix, &config.symbols_suffix),
            spec(
                TagKind::Variables,
                &config.variables_prefix,
                &config.variables_suffix,
            ),
        ];
        if let Some(tag) = tags.iter().find(|t| t.open.is_empty() || t.close.is_empty()) {
            return Err(SessionError::Config(format!(
                "empty marker for {:?} tag",
                tag.kind
            )));
        }

        let main_prompts = config
            .main_prompt_patterns
            .iter()
            .map(|pattern| {
                Regex::new(pattern).map_err(|e| {
                    SessionError::Config(format!("main prompt pattern '{}': {}", pattern, e))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let variable = Regex::new(
            r"(?s)<variable>\s*<name>(.*?)</name>\s*(?:<value>(.*?)</value>)?\s*</variable>",
        )
        .map_err(|e| SessionError::Config(e.to_string()))?;

        Ok(Self {
            tags,
            main_prompts,
            classifier: TextClassifier::new(&config.text_rules)?,
            variable,
        })
    }

    /// Decode everything currently decodable in `buffer`.
    ///
    /// Returns the events in stream order and the buffer holding the
    /// remainder, which is only partial content awaiting more bytes.
    pub fn decode(&self, mut buffer: RawBuffer) -> (Vec<Event>, RawBuffer) {
        let mut events = Vec::new();
        while let Step::Progress = self.step(&mut buffer, &mut events) {}
        buffer.refresh_tail_echo();
        (events, buffer)
    }

    /// [`decode`](Self::decode) for a buffer owned by someone else
    pub fn decode_in_place(&self, buffer: &mut RawBuffer) -> Vec<Event> {
        let (events, rest) = self.decode(std::mem::take(buffer));
        *buffer = rest;
        events
    }

    /// Classify a prompt's text
    pub fn prompt_kind(&self, text: &str) -> PromptKind {
        if self.main_prompts.iter().any(|re| re.is_match(text)) {
            PromptKind::Main
        } else {
            PromptKind::Question
        }
    }

    fn step(&self, buffer: &mut RawBuffer, events: &mut Vec<Event>) -> Step {
        let text = buffer.text();
        if text.is_empty() {
            return Step::NeedMoreInput;
        }

        if text.starts_with("\n<") {
            buffer.consume(1);
            return Step::Progress;
        }
        if text == "\n" {
            return Step::NeedMoreInput;
        }

        if let Some(tag) = self.tags.iter().find(|t| text.starts_with(t.open.as_str())) {
            return self.decode_tag(tag, buffer, events);
        }

        self.decode_untagged(buffer, events)
    }

    fn decode_tag(&self, tag: &TagSpec, buffer: &mut RawBuffer, events: &mut Vec<Event>) -> Step {
        if !buffer.close_may_be_present(&tag.close) {
            return Step::NeedMoreInput;
        }

        let text = buffer.text();
        let body_start = tag.open.len();
        let Some(close_at) = text[body_start..].find(tag.close.as_str()) else {
            buffer.mark_pending(&tag.close);
            return Step::NeedMoreInput;
        };
        let body_end = body_start + close_at;
        let mut unit_end = body_end + tag.close.len();
        if text[unit_end..].starts_with(' ') {
            unit_end += 1;
        }

        let body = text[body_start..body_end].to_string();
        debug!(tag = ?tag.kind, len = body.len(), "decoded tagged unit");
        match tag.kind {
            TagKind::Prompt => self.interpret_prompt(body, buffer, events),
            TagKind::Math => events.push(interpret_math(&body)),
            TagKind::StatusBar => events.push(Event::StatusBarText {
                text: xml_unescape(&body),
            }),
            TagKind::Symbols => events.push(Event::SymbolAnnouncement {
                symbols: xml_unescape(&body)
                    .split('$')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect(),
            }),
            TagKind::Variables => self.interpret_variables(&body, events),
        }

        buffer.consume(unit_end);
        Step::Progress
    }

    fn interpret_prompt(&self, body: String, buffer: &mut RawBuffer, events: &mut Vec<Event>) {
        if buffer.awaiting_first_prompt() {
            let pid = extract_pid(buffer.banner());
            debug!(?pid, "first prompt after startup");
            events.push(Event::EngineStarted { pid });
            buffer.mark_started();
        }
        let kind = self.prompt_kind(&body);
        events.push(Event::Prompt { text: body, kind });
    }

    fn interpret_variables(&self, body: &str, events: &mut Vec<Event>) {
        let before = events.len();
        for captures in self.variable.captures_iter(body) {
            let name = captures.get(1).map_or("", |m| m.as_str());
            let value = captures.get(2).map_or("", |m| m.as_str());
            events.push(Event::VariableAnnouncement {
                name: xml_unescape(name.trim()),
                value: xml_unescape(value),
            });
        }
        if events.len() == before && !body.trim().is_empty() {
            warn!("discarding malformed variables announcement: {}", body);
        }
    }

    fn decode_untagged(&self, buffer: &mut RawBuffer, events: &mut Vec<Event>) -> Step {
        let text = buffer.text();
        let nearest_tag = self
            .tags
            .iter()
            .filter_map(|t| text.find(t.open.as_str()))
            .min();

        // Without a tag in sight only complete lines are safe to emit: the
        // rest may still turn out to be the beginning of a tag.
        let end = match nearest_tag {
            Some(pos) => pos,
            None => match text.rfind('\n') {
                Some(pos) => pos + 1,
                None => return Step::NeedMoreInput,
            },
        };

        let chunk = text[..end].to_string();
        for line in chunk.split('\n') {
            let line = normalize_line(line);
            if line.is_empty() {
                continue;
            }
            let severity = self.classifier.classify(&line);
            events.push(Event::PlainText {
                text: line,
                severity,
            });
        }
        buffer.append_banner(&chunk);
        buffer.consume(end);
        Step::Progress
    }
}

/// Split a leading `<lbl>` element off math content
fn interpret_math(body: &str) -> Event {
    let trimmed = body.trim_start();
    let has_label = trimmed.starts_with("<lbl")
        && trimmed[4..]
            .chars()
            .next()
            .is_some_and(|c| c == '>' || c.is_whitespace());
    if has_label {
        if let (Some(open_end), Some(close)) = (trimmed.find('>'), trimmed.find("</lbl>")) {
            if open_end < close {
                let label = xml_unescape(trimmed[open_end + 1..close].trim());
                let text = trimmed[close + "</lbl>".len()..].to_string();
                return Event::MathOutput {
                    text,
                    label: Some(label),
                };
            }
        }
        warn!("math output with malformed label: {}", body);
    }
    Event::MathOutput {
        text: body.to_string(),
        label: None,
    }
}

/// Integer following `pid=` up to the end of its line
pub fn extract_pid(banner: &str) -> Option<u32> {
    let start = banner.find(PID_MARKER)? + PID_MARKER.len();
    let rest = &banner[start..];
    let line = rest.split('\n').next().unwrap_or(rest);
    line.trim().parse().ok()
}

/// Decode the XML character entities used by the engine. Unknown or
/// malformed entities are kept verbatim.
pub fn xml_unescape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        rest = &rest[amp..];
        let decoded = rest.find(';').and_then(|semi| {
            let entity = &rest[1..semi];
            let ch = match entity {
                "lt" => Some('<'),
                "gt" => Some('>'),
                "amp" => Some('&'),
                "quot" => Some('"'),
                "apos" => Some('\''),
                _ => entity
                    .strip_prefix("#x")
                    .or_else(|| entity.strip_prefix("#X"))
                    .and_then(|hex| u32::from_str_radix(hex, 16).ok())
                    .or_else(|| entity.strip_prefix('#').and_then(|dec| dec.parse().ok()))
                    .and_then(char::from_u32),
            };
            ch.map(|c| (c, semi))
        });
        match decoded {
            Some((ch, semi)) => {
                out.push(ch);
                rest = &rest[semi + 1..];
            }
            None => {
                out.push('&');
                rest = &rest[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Severity;

    fn demux() -> Demultiplexer {
        Demultiplexer::new(&ProtocolConfig::default()).unwrap()
    }

    fn decode_started(input: &str) -> (Vec<Event>, RawBuffer) {
        let mut buffer = RawBuffer::after_startup();
        buffer.push_str(input);
        demux().decode(buffer)
    }

    fn plain(text: &str, severity: Severity) -> Event {
        Event::PlainText {
            text: text.to_string(),
            severity,
        }
    }

    #[test]
    fn test_math_with_label() {
        let (events, rest) = decode_started("<mth><lbl>(%o1) </lbl>2</mth>");
        assert_eq!(
            events,
            vec![Event::MathOutput {
                text: "2".to_string(),
                label: Some("(%o1)".to_string())
            }]
        );
        assert!(rest.text().is_empty());
    }

    #[test]
    fn test_math_with_attributed_label_and_no_label() {
        let (events, _) =
            decode_started("<mth><lbl altCopy=\"x\">(%o2)</lbl><mi>x</mi></mth><mth>y</mth>");
        assert_eq!(
            events,
            vec![
                Event::MathOutput {
                    text: "<mi>x</mi>".to_string(),
                    label: Some("(%o2)".to_string())
                },
                Event::MathOutput {
                    text: "y".to_string(),
                    label: None
                }
            ]
        );
    }

    #[test]
    fn test_prompt_classification() {
        let (events, _) =
            decode_started("<PROMPT-P/>(%i3) <PROMPT-S/><PROMPT-P/>Is x positive? <PROMPT-S/>");
        assert_eq!(
            events,
            vec![
                Event::Prompt {
                    text: "(%i3) ".to_string(),
                    kind: PromptKind::Main
                },
                Event::Prompt {
                    text: "Is x positive? ".to_string(),
                    kind: PromptKind::Question
                }
            ]
        );
        assert_eq!(demux().prompt_kind("MAXIMA> "), PromptKind::Main);
    }

    #[test]
    fn test_first_prompt_carries_pid() {
        let mut buffer = RawBuffer::new();
        buffer.push_str("Maxima 5.47\npid=4242\n<PROMPT-P/>(%i1) <PROMPT-S/>");
        let (events, rest) = demux().decode(buffer);
        assert_eq!(
            events,
            vec![
                plain("Maxima 5.47", Severity::Default),
                plain("pid=4242", Severity::Default),
                Event::EngineStarted { pid: Some(4242) },
                Event::Prompt {
                    text: "(%i1) ".to_string(),
                    kind: PromptKind::Main
                }
            ]
        );
        assert!(!rest.awaiting_first_prompt());
    }

    #[test]
    fn test_statusbar_symbols_and_variables() {
        let (events, _) = decode_started(
            "<statusbar>a &lt; b</statusbar><wxxml-symbols>f$g$</wxxml-symbols>\
             <variables><variable><name>x</name><value>1 &amp; 2</value></variable>\
             <variable><name>y</name></variable></variables>",
        );
        assert_eq!(
            events,
            vec![
                Event::StatusBarText {
                    text: "a < b".to_string()
                },
                Event::SymbolAnnouncement {
                    symbols: vec!["f".to_string(), "g".to_string()]
                },
                Event::VariableAnnouncement {
                    name: "x".to_string(),
                    value: "1 & 2".to_string()
                },
                Event::VariableAnnouncement {
                    name: "y".to_string(),
                    value: String::new()
                },
            ]
        );
    }

    #[test]
    fn test_malformed_fragment_is_consumed() {
        let (events, rest) = decode_started("<variables><variable><name>x</variables>");
        assert!(events.is_empty());
        assert!(rest.text().is_empty());

        let (events, _) = decode_started("<statusbar>a &bogus; b</statusbar>");
        assert_eq!(
            events,
            vec![Event::StatusBarText {
                text: "a &bogus; b".to_string()
            }]
        );
    }

    #[test]
    fn test_untagged_text_is_classified_per_line() {
        let (events, rest) =
            decode_started("x  =   1\n\nincorrect syntax: oops\nWarning: careful\npartial");
        assert_eq!(
            events,
            vec![
                plain("x = 1", Severity::Default),
                plain("incorrect syntax: oops", Severity::Error),
                plain("Warning: careful", Severity::Warning),
            ]
        );
        assert_eq!(rest.text(), "partial");
    }

    #[test]
    fn test_text_before_tag_is_flushed() {
        let (events, rest) = decode_started("abc<mth>1</mth> tail");
        assert_eq!(
            events,
            vec![
                plain("abc", Severity::Default),
                Event::MathOutput {
                    text: "1".to_string(),
                    label: None
                }
            ]
        );
        assert_eq!(rest.text(), "tail");
    }

    #[test]
    fn test_newline_before_tag_is_stripped() {
        let (events, rest) = decode_started("\n<mth>1</mth>\n");
        assert_eq!(events.len(), 1);
        assert_eq!(rest.text(), "\n");
    }

    #[test]
    fn test_split_close_marker_waits() {
        let demux = demux();
        let mut buffer = RawBuffer::after_startup();
        buffer.push_str("<mth>2</mt");
        let (events, mut buffer) = demux.decode(buffer);
        assert!(events.is_empty());
        assert_eq!(buffer.text(), "<mth>2</mt");

        buffer.push_str("h>");
        let (events, buffer) = demux.decode(buffer);
        assert_eq!(events.len(), 1);
        assert!(buffer.text().is_empty());
    }

    #[test]
    fn test_extract_pid() {
        assert_eq!(extract_pid("banner\npid=123\nmore"), Some(123));
        assert_eq!(extract_pid("pid= 77"), Some(77));
        assert_eq!(extract_pid("pid=abc\n"), None);
        assert_eq!(extract_pid("no pid here"), None);
    }

    #[test]
    fn test_xml_unescape() {
        assert_eq!(xml_unescape("&lt;a&gt; &amp;&#65;&#x42;"), "<a> &AB");
        assert_eq!(xml_unescape("a & b"), "a & b");
        assert_eq!(xml_unescape("&unknown;"), "&unknown;");
    }

    #[test]
    fn test_invalid_prompt_pattern_is_config_error() {
        let config = ProtocolConfig {
            main_prompt_patterns: vec!["(".to_string()],
            ..ProtocolConfig::default()
        };
        assert!(matches!(
            Demultiplexer::new(&config),
            Err(SessionError::Config(_))
        ));
    }
}
