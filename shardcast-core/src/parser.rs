//! SQL hint scanner.
//!
//! The proxy never parses SQL. It scans for `/*+ ... */` blocks and the
//! three routing hints inside them, tracking quotes, comments and bind
//! markers just enough to know which characters count. `shard_val(v)` and
//! static `shard_key(v)` hints are rewritten to `shard_id(n)` in place so
//! the cache key is routing-stable; the rewrite is idempotent.

use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ParseError {
    #[error("invalid shard hint: {0}")]
    InvalidHint(String),
    #[error("unterminated hint comment")]
    UnterminatedComment,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HintType {
    None,
    Key,
    Val,
    Id,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindType {
    Static,
    Dynamic,
}

#[derive(Debug, Clone)]
pub struct Hint {
    pub hint_type: HintType,
    pub bind_type: BindType,
    /// For dynamic hints: ordinal of the bind marker the hint routes by
    /// (the next `?` after the hint).
    pub bind_position: usize,
    /// For static hints: the literal value inside the parentheses.
    pub value: String,
    /// Byte range of `shard_xxx(...)` inside the statement text.
    pub span: (usize, usize),
}

impl Hint {
    pub fn is_static(&self) -> bool {
        self.bind_type == BindType::Static
    }
}

#[derive(Debug, Clone, Default)]
pub struct ParsedSql {
    pub sql: String,
    pub hints: Vec<Hint>,
    pub bind_count: usize,
}

pub fn parse(sql: &str) -> Result<ParsedSql, ParseError> {
    let bytes = sql.as_bytes();
    let mut hints = Vec::new();
    let mut bind_count = 0usize;
    let mut i = 0usize;

    while i < bytes.len() {
        match bytes[i] {
            b'\'' => i = skip_quoted(bytes, i, b'\''),
            b'"' => i = skip_quoted(bytes, i, b'"'),
            b'-' if bytes.get(i + 1) == Some(&b'-') => i = skip_line(bytes, i),
            b'/' if bytes.get(i + 1) == Some(&b'/') => i = skip_line(bytes, i),
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                if bytes.get(i + 2) == Some(&b'+') {
                    i = scan_hint_block(sql, i, bind_count, &mut hints)?;
                } else {
                    i = skip_block_comment(bytes, i);
                }
            }
            b'?' => {
                bind_count += 1;
                i += 1;
            }
            _ => i += 1,
        }
    }

    Ok(ParsedSql {
        sql: sql.to_string(),
        hints,
        bind_count,
    })
}

/// Replaces every static `shard_key`/`shard_val` hint with `shard_id(n)`.
/// `resolve` maps a key value to its shard; `None` means the value falls in
/// no configured range. `shard_id` hints pass through untouched, which makes
/// a second rewrite a no-op.
pub fn rewrite_to_shard_id(
    parsed: &ParsedSql,
    resolve: impl Fn(&str) -> Option<i32>,
) -> Option<String> {
    let mut out = String::with_capacity(parsed.sql.len());
    let mut pos = 0usize;
    for hint in &parsed.hints {
        if !hint.is_static() || hint.hint_type == HintType::Id {
            continue;
        }
        let shard_id = resolve(&hint.value)?;
        out.push_str(&parsed.sql[pos..hint.span.0]);
        out.push_str(&format!("shard_id({})", shard_id));
        pos = hint.span.1;
    }
    out.push_str(&parsed.sql[pos..]);
    Some(out)
}

fn skip_quoted(bytes: &[u8], start: usize, quote: u8) -> usize {
    let mut i = start + 1;
    while i < bytes.len() {
        if bytes[i] == quote {
            // doubled quote is an escape
            if bytes.get(i + 1) == Some(&quote) {
                i += 2;
                continue;
            }
            return i + 1;
        }
        i += 1;
    }
    i
}

fn skip_line(bytes: &[u8], start: usize) -> usize {
    let mut i = start + 2;
    while i < bytes.len() && bytes[i] != b'\n' {
        i += 1;
    }
    i
}

fn skip_block_comment(bytes: &[u8], start: usize) -> usize {
    let mut i = start + 2;
    while i + 1 < bytes.len() {
        if bytes[i] == b'*' && bytes[i + 1] == b'/' {
            return i + 2;
        }
        i += 1;
    }
    bytes.len()
}

fn scan_hint_block(
    sql: &str,
    start: usize,
    binds_before: usize,
    hints: &mut Vec<Hint>,
) -> Result<usize, ParseError> {
    let bytes = sql.as_bytes();
    let mut i = start + 3; // past "/*+"

    loop {
        if i + 1 >= bytes.len() {
            return Err(ParseError::UnterminatedComment);
        }
        if bytes[i] == b'*' && bytes[i + 1] == b'/' {
            return Ok(i + 2);
        }
        if bytes[i].is_ascii_alphabetic() || bytes[i] == b'_' {
            let ident_start = i;
            while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
                i += 1;
            }
            let ident = sql[ident_start..i].to_ascii_lowercase();
            let hint_type = match ident.as_str() {
                "shard_key" => HintType::Key,
                "shard_val" => HintType::Val,
                "shard_id" => HintType::Id,
                _ => continue,
            };
            let (arg, end) = read_hint_arg(sql, i)?;
            hints.push(make_hint(hint_type, &arg, binds_before, (ident_start, end))?);
            i = end;
        } else {
            i += 1;
        }
    }
}

fn read_hint_arg(sql: &str, mut i: usize) -> Result<(String, usize), ParseError> {
    let bytes = sql.as_bytes();
    while i < bytes.len() && bytes[i].is_ascii_whitespace() {
        i += 1;
    }
    if bytes.get(i) != Some(&b'(') {
        return Err(ParseError::InvalidHint("missing argument".to_string()));
    }
    i += 1;
    let arg_start = i;
    while i < bytes.len() && bytes[i] != b')' {
        if bytes[i] == b'*' && bytes.get(i + 1) == Some(&b'/') {
            return Err(ParseError::InvalidHint("unclosed argument".to_string()));
        }
        i += 1;
    }
    if i >= bytes.len() {
        return Err(ParseError::UnterminatedComment);
    }
    let arg = sql[arg_start..i].trim().to_string();
    Ok((arg, i + 1))
}

fn make_hint(
    hint_type: HintType,
    arg: &str,
    binds_before: usize,
    span: (usize, usize),
) -> Result<Hint, ParseError> {
    if arg.is_empty() {
        return Err(ParseError::InvalidHint("empty argument".to_string()));
    }
    if arg == "?" {
        if hint_type != HintType::Key {
            return Err(ParseError::InvalidHint(
                "only shard_key takes a bind marker".to_string(),
            ));
        }
        return Ok(Hint {
            hint_type,
            bind_type: BindType::Dynamic,
            bind_position: binds_before,
            value: String::new(),
            span,
        });
    }
    let value = strip_quotes(arg).to_string();
    if hint_type == HintType::Id && value.parse::<i32>().is_err() {
        return Err(ParseError::InvalidHint(format!(
            "shard_id wants an integer, got {}",
            value
        )));
    }
    Ok(Hint {
        hint_type,
        bind_type: BindType::Static,
        bind_position: 0,
        value,
        span,
    })
}

fn strip_quotes(arg: &str) -> &str {
    let bytes = arg.as_bytes();
    if bytes.len() >= 2
        && (bytes[0] == b'\'' || bytes[0] == b'"')
        && bytes[bytes.len() - 1] == bytes[0]
    {
        &arg[1..arg.len() - 1]
    } else {
        arg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_shard_id_hint() {
        let parsed = parse("/*+ shard_id(1) */ SELECT 1").unwrap();
        assert_eq!(parsed.hints.len(), 1);
        let hint = &parsed.hints[0];
        assert_eq!(hint.hint_type, HintType::Id);
        assert!(hint.is_static());
        assert_eq!(hint.value, "1");
        assert_eq!(&parsed.sql[hint.span.0..hint.span.1], "shard_id(1)");
    }

    #[test]
    fn dynamic_shard_key_binds_to_next_marker() {
        let parsed =
            parse("SELECT * FROM t WHERE a = ? AND /*+ shard_key(?) */ k = ?").unwrap();
        assert_eq!(parsed.bind_count, 2);
        let hint = &parsed.hints[0];
        assert_eq!(hint.hint_type, HintType::Key);
        assert_eq!(hint.bind_type, BindType::Dynamic);
        assert_eq!(hint.bind_position, 1);
    }

    #[test]
    fn binds_in_quotes_and_comments_do_not_count() {
        let parsed = parse("SELECT '?' || \"?\" -- ? trailing\n FROM t WHERE k = ?").unwrap();
        assert_eq!(parsed.bind_count, 1);

        let parsed = parse("SELECT 'it''s ?' FROM t").unwrap();
        assert_eq!(parsed.bind_count, 0);
    }

    #[test]
    fn shard_val_rewrites_to_shard_id() {
        let parsed = parse("/*+ shard_val(150) */ SELECT 1").unwrap();
        let rewritten = rewrite_to_shard_id(&parsed, |v| {
            assert_eq!(v, "150");
            Some(1)
        })
        .unwrap();
        assert_eq!(rewritten, "/*+ shard_id(1) */ SELECT 1");
    }

    #[test]
    fn static_shard_key_rewrites_like_shard_val() {
        let parsed = parse("/*+ shard_key('abc') */ SELECT 1").unwrap();
        let rewritten = rewrite_to_shard_id(&parsed, |v| {
            assert_eq!(v, "abc");
            Some(0)
        })
        .unwrap();
        assert_eq!(rewritten, "/*+ shard_id(0) */ SELECT 1");
    }

    #[test]
    fn rewrite_is_idempotent() {
        let parsed = parse("/*+ shard_val(150) */ SELECT 1").unwrap();
        let once = rewrite_to_shard_id(&parsed, |_| Some(1)).unwrap();
        let reparsed = parse(&once).unwrap();
        let twice = rewrite_to_shard_id(&reparsed, |_| Some(1)).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn unresolvable_value_fails_rewrite() {
        let parsed = parse("/*+ shard_val(99999) */ SELECT 1").unwrap();
        assert!(rewrite_to_shard_id(&parsed, |_| None).is_none());
    }

    #[test]
    fn hint_in_plain_comment_is_ignored() {
        let parsed = parse("/* shard_id(1) */ SELECT 1").unwrap();
        assert!(parsed.hints.is_empty());
    }

    #[test]
    fn multiple_hints_are_collected() {
        let parsed = parse("/*+ shard_id(0) shard_key(5) */ SELECT 1").unwrap();
        assert_eq!(parsed.hints.len(), 2);
        assert_eq!(parsed.hints[0].hint_type, HintType::Id);
        assert_eq!(parsed.hints[1].hint_type, HintType::Key);
    }

    #[test]
    fn malformed_hints_are_rejected() {
        assert!(matches!(
            parse("/*+ shard_id */ SELECT 1"),
            Err(ParseError::InvalidHint(_))
        ));
        assert!(matches!(
            parse("/*+ shard_id(x) */ SELECT 1"),
            Err(ParseError::InvalidHint(_))
        ));
        assert!(matches!(
            parse("/*+ shard_id(1 SELECT 1"),
            Err(ParseError::InvalidHint(_)) | Err(ParseError::UnterminatedComment)
        ));
        assert!(matches!(
            parse("/*+ shard_id(1) SELECT 1"),
            Err(ParseError::UnterminatedComment)
        ));
        assert!(matches!(
            parse("/*+ shard_val(?) */ SELECT 1"),
            Err(ParseError::InvalidHint(_))
        ));
    }

    #[test]
    fn other_hint_words_pass_through() {
        let parsed = parse("/*+ USE_MERGE shard_id(1) */ SELECT 1").unwrap();
        assert_eq!(parsed.hints.len(), 1);
    }
}
