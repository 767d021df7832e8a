//! Glob pattern parsing and segment-wise matching.

use super::FileSetError;

/// Prefix that turns a pattern into an exclusion.
pub const EXCLUDE_PREFIX: &str = "-:";

/// Whether a pattern adds or removes paths from the working set.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PatternMode {
    /// Adds matching paths not already present.
    Include,
    /// Removes matching paths wherever they were added.
    Exclude,
}

/// Parsed glob pattern with its inclusion mode.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Pattern {
    glob: String,
    mode: PatternMode,
    segments: Vec<Segment>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
enum Segment {
    AnyDepth,
    Component(Vec<Token>),
}

#[derive(Clone, Debug, Eq, PartialEq)]
enum Token {
    Literal(char),
    AnyChar,
    AnyRun,
    Class {
        negated: bool,
        ranges: Vec<(char, char)>,
    },
}

impl Pattern {
    /// Parses a raw pattern string, splitting off the exclusion prefix.
    ///
    /// # Errors
    ///
    /// Returns [`FileSetError::InvalidPattern`] when the pattern is empty,
    /// absolute, or contains an unterminated character class.
    pub fn parse(raw: &str) -> Result<Self, FileSetError> {
        let (mode, body) = raw.strip_prefix(EXCLUDE_PREFIX).map_or(
            (PatternMode::Include, raw),
            |rest| (PatternMode::Exclude, rest),
        );
        let glob = body.trim();
        let invalid = |reason: &str| FileSetError::InvalidPattern {
            pattern: raw.to_owned(),
            reason: reason.to_owned(),
        };

        if glob.starts_with('/') {
            return Err(invalid("patterns must be relative to the working directory"));
        }

        let segments = glob
            .split('/')
            .filter(|part| !part.is_empty() && *part != ".")
            .map(|part| parse_segment(part).ok_or_else(|| invalid("unterminated character class")))
            .collect::<Result<Vec<_>, _>>()?;

        if segments.is_empty() {
            return Err(invalid("pattern is empty"));
        }

        Ok(Self {
            glob: glob.to_owned(),
            mode,
            segments,
        })
    }

    /// Parses every pattern in order.
    ///
    /// # Errors
    ///
    /// Returns the first [`FileSetError::InvalidPattern`] encountered.
    pub fn parse_all<S: AsRef<str>>(raw: &[S]) -> Result<Vec<Self>, FileSetError> {
        raw.iter().map(|item| Self::parse(item.as_ref())).collect()
    }

    /// Returns the glob text without the exclusion prefix.
    #[must_use]
    pub fn glob(&self) -> &str {
        &self.glob
    }

    /// Returns whether the pattern includes or excludes.
    #[must_use]
    pub const fn mode(&self) -> PatternMode {
        self.mode
    }

    /// Checks whether a relative path, given as its components, matches.
    #[must_use]
    pub fn matches(&self, components: &[&str]) -> bool {
        match_segments(&self.segments, components)
    }
}

fn is_hidden(name: &str) -> bool {
    name.starts_with('.')
}

fn match_segments(segments: &[Segment], components: &[&str]) -> bool {
    match segments.split_first() {
        None => components.is_empty(),
        Some((Segment::AnyDepth, [])) => {
            !components.is_empty() && components.iter().all(|name| !is_hidden(name))
        }
        Some((Segment::AnyDepth, rest)) => {
            if match_segments(rest, components) {
                return true;
            }
            match components.split_first() {
                Some((head, tail)) if !is_hidden(head) => match_segments(segments, tail),
                _ => false,
            }
        }
        Some((Segment::Component(tokens), rest)) => match components.split_first() {
            Some((head, tail)) => match_component(tokens, head) && match_segments(rest, tail),
            None => false,
        },
    }
}

fn match_component(tokens: &[Token], name: &str) -> bool {
    if is_hidden(name) && !matches!(tokens.first(), Some(Token::Literal('.'))) {
        return false;
    }
    let chars: Vec<char> = name.chars().collect();
    match_tokens(tokens, &chars)
}

fn match_tokens(tokens: &[Token], chars: &[char]) -> bool {
    let Some((token, rest)) = tokens.split_first() else {
        return chars.is_empty();
    };
    match token {
        Token::AnyRun => {
            let mut remaining = chars;
            loop {
                if match_tokens(rest, remaining) {
                    return true;
                }
                match remaining.split_first() {
                    Some((_, tail)) => remaining = tail,
                    None => return false,
                }
            }
        }
        Token::AnyChar => chars
            .split_first()
            .is_some_and(|(_, tail)| match_tokens(rest, tail)),
        Token::Literal(expected) => chars
            .split_first()
            .is_some_and(|(ch, tail)| ch == expected && match_tokens(rest, tail)),
        Token::Class { negated, ranges } => chars.split_first().is_some_and(|(ch, tail)| {
            let hit = ranges.iter().any(|&(lo, hi)| (lo..=hi).contains(ch));
            hit != *negated && match_tokens(rest, tail)
        }),
    }
}

fn parse_segment(part: &str) -> Option<Segment> {
    if part == "**" {
        return Some(Segment::AnyDepth);
    }

    let mut tokens = Vec::new();
    let mut chars = part.chars().peekable();
    while let Some(ch) = chars.next() {
        let token = match ch {
            '*' => {
                while chars.peek() == Some(&'*') {
                    chars.next();
                }
                Token::AnyRun
            }
            '?' => Token::AnyChar,
            '[' => parse_class(&mut chars)?,
            other => Token::Literal(other),
        };
        tokens.push(token);
    }
    Some(Segment::Component(tokens))
}

fn parse_class(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) -> Option<Token> {
    let negated = chars.next_if(|ch| *ch == '!' || *ch == '^').is_some();
    let mut ranges = Vec::new();
    let mut first = true;
    loop {
        let ch = chars.next()?;
        if ch == ']' && !first {
            break;
        }
        first = false;
        if chars.peek() == Some(&'-') {
            chars.next();
            match chars.next()? {
                ']' => {
                    ranges.push((ch, ch));
                    ranges.push(('-', '-'));
                    break;
                }
                hi => ranges.push((ch, hi)),
            }
        } else {
            ranges.push((ch, ch));
        }
    }
    Some(Token::Class { negated, ranges })
}
