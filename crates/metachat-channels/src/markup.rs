//! Canonical markup: the formatting language carried in `Message::text`.
//!
//! Every construct is a pair of start/end markers around its payload:
//!
//! ```text
//! #{bold}text{bold}#
//! #{quote author=Alice}text{quote}#
//! ```
//!
//! Adapters decode their platform's rich text into these tags on receipt and
//! render them back with a [`Dialect`] on send. Rendering is best-effort:
//! unknown or unbalanced tags are left in the output as literal text.

use regex_lite::{Captures, Regex};
use std::sync::OnceLock;

/// Marks the position of a protected span while other rules run.
const SENTINEL: char = '\u{FFFC}';

/// A canonical markup construct.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tag {
    Bold,
    Italic,
    Strikethrough,
    Preformatted,
    Mention,
    Quote,
    Edit,
}

/// Inline constructs in substitution order.
///
/// Preformatted is handled before all of these; Quote comes last because it
/// wraps other constructs.
const INLINE_ORDER: [Tag; 6] = [
    Tag::Bold,
    Tag::Italic,
    Tag::Strikethrough,
    Tag::Mention,
    Tag::Edit,
    Tag::Quote,
];

impl Tag {
    /// All constructs.
    pub const ALL: [Tag; 7] = [
        Tag::Bold,
        Tag::Italic,
        Tag::Strikethrough,
        Tag::Preformatted,
        Tag::Mention,
        Tag::Quote,
        Tag::Edit,
    ];

    /// Marker name used inside the tag.
    pub fn name(self) -> &'static str {
        match self {
            Tag::Bold => "bold",
            Tag::Italic => "italic",
            Tag::Strikethrough => "strikethrough",
            Tag::Preformatted => "preformatted",
            Tag::Mention => "mention",
            Tag::Quote => "quote",
            Tag::Edit => "edit",
        }
    }

    /// Pattern matching one span of this construct.
    ///
    /// Capture 1 is the payload, except for Quote where capture 1 is the
    /// author and capture 2 the payload.
    pub fn pattern(self) -> &'static Regex {
        static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
        let patterns = PATTERNS.get_or_init(|| {
            Tag::ALL
                .iter()
                .map(|tag| {
                    let source = match tag {
                        Tag::Quote => r"(?s)#\{quote author=([^}]*)\}(.*?)\{quote\}#".to_string(),
                        other => {
                            let name = other.name();
                            format!(r"(?s)#\{{{name}\}}(.*?)\{{{name}\}}#")
                        }
                    };
                    Regex::new(&source).expect("markup tag pattern is valid")
                })
                .collect()
        });
        &patterns[self.index()]
    }

    fn index(self) -> usize {
        match self {
            Tag::Bold => 0,
            Tag::Italic => 1,
            Tag::Strikethrough => 2,
            Tag::Preformatted => 3,
            Tag::Mention => 4,
            Tag::Quote => 5,
            Tag::Edit => 6,
        }
    }
}

/// Wrap `payload` in the canonical markers for `tag`.
///
/// A Quote produced this way has an empty author; use [`quote`] to set one.
pub fn encode(tag: Tag, payload: &str) -> String {
    match tag {
        Tag::Quote => quote(payload, ""),
        other => {
            let name = other.name();
            format!("#{{{name}}}{payload}{{{name}}}#")
        }
    }
}

/// Mark text as bold.
pub fn bold(text: &str) -> String {
    encode(Tag::Bold, text)
}

/// Mark text as italic.
pub fn italic(text: &str) -> String {
    encode(Tag::Italic, text)
}

/// Mark text as strikethrough.
pub fn strikethrough(text: &str) -> String {
    encode(Tag::Strikethrough, text)
}

/// Mark text as preformatted.
pub fn preformatted(text: &str) -> String {
    encode(Tag::Preformatted, text)
}

/// Mark text as a mention of a user's display name.
pub fn mention(text: &str) -> String {
    encode(Tag::Mention, text)
}

/// Mark text as an edited version of an earlier message.
pub fn edit(text: &str) -> String {
    encode(Tag::Edit, text)
}

/// Mark text as a quote of `author`.
///
/// `}` cannot appear in the author attribute and is replaced by `)`.
pub fn quote(text: &str, author: &str) -> String {
    let author = author.replace('}', ")");
    format!("#{{quote author={author}}}{text}{{quote}}#")
}

/// A platform's native rendering rules.
///
/// Templates use `${1}` for the payload; Quote templates use `${1}` for
/// the author and `${2}` for the payload. A literal `$` is written `$$`.
#[derive(Debug, Clone, Copy)]
pub struct Dialect {
    /// Dialect name, for logs.
    pub name: &'static str,
    /// Native template per construct. Missing constructs render as their
    /// bare payload.
    pub rules: &'static [(Tag, &'static str)],
    /// Escapes literal text so it is not read as native markup.
    pub escape: Option<fn(&str) -> String>,
    /// Escapes the payload of preformatted spans, for platforms whose
    /// escaping also applies inside code.
    pub pre_escape: Option<fn(&str) -> String>,
    /// Text placed before and after the author name on attributed messages.
    pub attribution: (&'static str, &'static str),
}

impl Dialect {
    /// Template for `tag`, falling back to the bare payload.
    pub fn template(&self, tag: Tag) -> &'static str {
        self.rules
            .iter()
            .find(|(t, _)| *t == tag)
            .map(|(_, template)| *template)
            .unwrap_or(match tag {
                Tag::Quote => "${2}",
                _ => "${1}",
            })
    }

    fn escape_literal(&self, text: &str) -> String {
        match self.escape {
            Some(escape) => escape(text),
            None => text.to_string(),
        }
    }
}

/// Plain-text dialect: drops all formatting but keeps quote authors.
pub const PLAIN: Dialect = Dialect {
    name: "plain",
    rules: &[(Tag::Quote, "${1}: ${2}"), (Tag::Mention, "@${1}")],
    escape: None,
    pre_escape: None,
    attribution: ("[", "] "),
};

/// Render canonical markup into `dialect`'s native syntax.
///
/// Preformatted spans are rendered first and shielded from every later
/// rule. Only the dialect's `pre_escape` touches their payload.
pub fn render(canonical: &str, dialect: &Dialect) -> String {
    let pre_template = dialect.template(Tag::Preformatted);
    protect_spans(
        canonical,
        Tag::Preformatted.pattern(),
        |caps| match dialect.pre_escape {
            Some(escape) => Tag::Preformatted
                .pattern()
                .replace(&preformatted(&escape(&caps[1])), pre_template)
                .into_owned(),
            None => {
                let mut out = String::new();
                caps.expand(pre_template, &mut out);
                out
            }
        },
        |rest| {
            let mut out = dialect.escape_literal(rest);
            for tag in INLINE_ORDER {
                out = tag
                    .pattern()
                    .replace_all(&out, dialect.template(tag))
                    .into_owned();
            }
            out
        },
    )
}

/// Render a message body and prefix the author attribution when the
/// message has an author.
pub fn render_message(message: &metachat_types::message::Message, dialect: &Dialect) -> String {
    let body = render(&message.text, dialect);
    if message.author.is_empty() {
        return body;
    }
    let (prefix, suffix) = dialect.attribution;
    format!(
        "{prefix}{}{suffix}{body}",
        dialect.escape_literal(&message.author)
    )
}

/// Remove all markup, leaving readable plain text.
pub fn strip(canonical: &str) -> String {
    render(canonical, &PLAIN)
}

/// Run `transform` over `text` with every match of `span` shielded.
///
/// Each match is replaced by the output of `render_span` after `transform`
/// has run, so `transform` never sees or alters span contents.
pub(crate) fn protect_spans<S, T>(text: &str, span: &Regex, mut render_span: S, transform: T) -> String
where
    S: FnMut(&Captures<'_>) -> String,
    T: FnOnce(&str) -> String,
{
    static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();
    let placeholder = PLACEHOLDER.get_or_init(|| {
        Regex::new("\u{FFFC}([0-9]+)\u{FFFC}").expect("placeholder pattern is valid")
    });

    let cleaned = text.replace(SENTINEL, "\u{FFFD}");
    let mut protected: Vec<String> = Vec::new();
    let masked = span.replace_all(&cleaned, |caps: &Captures<'_>| {
        protected.push(render_span(caps));
        format!("{SENTINEL}{}{SENTINEL}", protected.len() - 1)
    });

    let transformed = transform(&masked);

    placeholder
        .replace_all(&transformed, |caps: &Captures<'_>| {
            caps[1]
                .parse::<usize>()
                .ok()
                .and_then(|idx| protected.get(idx).cloned())
                .unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}
