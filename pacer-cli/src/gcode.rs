//! G-code line scanner.
//!
//! Splits a line into letter/number words. Comments after `;` and inside
//! parentheses are dropped. A letter without a number reads as zero, so
//! `G28 X Y` names axes the same way `G28 X0 Y0` does.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("expected a letter at column {0}")]
    ExpectedLetter(usize),

    #[error("bad number after '{letter}': {text}")]
    BadNumber { letter: char, text: String },

    #[error("unterminated comment")]
    UnterminatedComment,

    #[error("line has no command")]
    NoCommand,
}

/// One letter/number pair.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Word {
    pub letter: char,
    pub value: f64,
}

/// A parsed line: the leading command word and its arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct Line {
    pub command: Word,
    pub args: Vec<Word>,
}

impl Line {
    /// Command letter and integer code, e.g. `('G', 1)`.
    pub fn code(&self) -> (char, u32) {
        (self.command.letter, self.command.value.max(0.0) as u32)
    }

    /// Value of the first argument with `letter`.
    pub fn arg(&self, letter: char) -> Option<f64> {
        self.args.iter().find(|w| w.letter == letter).map(|w| w.value)
    }

    pub fn has(&self, letter: char) -> bool {
        self.arg(letter).is_some()
    }
}

/// Scans `text` into words, ignoring comments and whitespace.
pub fn scan(text: &str) -> Result<Vec<Word>, ParseError> {
    let chars: Vec<char> = text.chars().collect();
    let mut words = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            ';' => break,
            '(' => {
                let close = chars[i..]
                    .iter()
                    .position(|&c| c == ')')
                    .ok_or(ParseError::UnterminatedComment)?;
                i += close + 1;
            }
            c if c.is_whitespace() => i += 1,
            c if c.is_ascii_alphabetic() => {
                let letter = c.to_ascii_uppercase();
                i += 1;
                while i < chars.len() && chars[i] == ' ' {
                    i += 1;
                }
                let start = i;
                while i < chars.len()
                    && (chars[i].is_ascii_digit() || matches!(chars[i], '.' | '-' | '+'))
                {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let value = if text.is_empty() {
                    0.0
                } else {
                    text.parse::<f64>()
                        .map_err(|_| ParseError::BadNumber { letter, text })?
                };
                words.push(Word { letter, value });
            }
            _ => return Err(ParseError::ExpectedLetter(i)),
        }
    }

    Ok(words)
}

/// Parses a line; `None` for blank or comment-only lines.
///
/// A leading `N` line number is skipped.
pub fn parse_line(text: &str) -> Result<Option<Line>, ParseError> {
    let mut words = scan(text)?.into_iter().peekable();
    if words.peek().is_some_and(|w| w.letter == 'N') {
        words.next();
    }
    let Some(command) = words.next() else {
        return Ok(None);
    };
    if !matches!(command.letter, 'G' | 'M' | 'T') {
        return Err(ParseError::NoCommand);
    }
    Ok(Some(Line {
        command,
        args: words.collect(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_move() {
        let line = parse_line("G1 X10.5 Y-3 F1200").unwrap().unwrap();
        assert_eq!(line.code(), ('G', 1));
        assert_eq!(line.arg('X'), Some(10.5));
        assert_eq!(line.arg('Y'), Some(-3.0));
        assert_eq!(line.arg('F'), Some(1200.0));
        assert!(!line.has('Z'));
    }

    #[test]
    fn test_comments_dropped() {
        let line = parse_line("g0 (rapid) x1 ; trailing").unwrap().unwrap();
        assert_eq!(line.code(), ('G', 0));
        assert_eq!(line.args, vec![Word { letter: 'X', value: 1.0 }]);

        assert_eq!(parse_line("; only a comment").unwrap(), None);
        assert_eq!(parse_line("   ").unwrap(), None);
        assert_eq!(parse_line("(note)").unwrap(), None);
    }

    #[test]
    fn test_line_number_skipped() {
        let line = parse_line("N42 M105").unwrap().unwrap();
        assert_eq!(line.code(), ('M', 105));
    }

    #[test]
    fn test_bare_letters() {
        let line = parse_line("G28 X Y").unwrap().unwrap();
        assert_eq!(line.code(), ('G', 28));
        assert_eq!(line.arg('X'), Some(0.0));
        assert_eq!(line.arg('Y'), Some(0.0));
    }

    #[test]
    fn test_spaced_number() {
        let line = parse_line("M104 S 200").unwrap().unwrap();
        assert_eq!(line.arg('S'), Some(200.0));
    }

    #[test]
    fn test_errors() {
        assert_eq!(
            parse_line("G1 (open"),
            Err(ParseError::UnterminatedComment)
        );
        assert!(matches!(
            parse_line("G1 X1.2.3"),
            Err(ParseError::BadNumber { letter: 'X', .. })
        ));
        assert_eq!(parse_line("X10"), Err(ParseError::NoCommand));
        assert_eq!(parse_line("G1 *5"), Err(ParseError::ExpectedLetter(3)));
    }
}
