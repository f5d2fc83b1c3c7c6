//! Limit/offset injection for text queries.

/// Byte offset of the first top-level occurrence of any of `keywords`.
///
/// Keywords match whole words case-insensitively. Anything inside quotes,
/// backticks or parentheses is skipped.
pub fn find_trailing_clause(query: &str, keywords: &[String]) -> Option<usize> {
    let bytes = query.as_bytes();
    let mut depth = 0usize;
    let mut idx = 0;

    while idx < bytes.len() {
        let b = bytes[idx];
        match b {
            b'\'' | b'"' | b'`' => {
                idx = skip_quoted(bytes, idx, b);
                continue;
            }
            b'(' => depth += 1,
            b')' => depth = depth.saturating_sub(1),
            b if is_word_byte(b) => {
                let start = idx;
                while idx < bytes.len() && is_word_byte(bytes[idx]) {
                    idx += 1;
                }
                if depth == 0 {
                    let word = &query[start..idx];
                    if keywords.iter().any(|k| k.eq_ignore_ascii_case(word)) {
                        return Some(start);
                    }
                }
                continue;
            }
            _ => (),
        }
        idx += 1;
    }
    None
}

fn is_word_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b >= 0x80
}

/// Index just past the closing quote. Doubled quotes are escapes.
fn skip_quoted(bytes: &[u8], open: usize, quote: u8) -> usize {
    let mut idx = open + 1;
    while idx < bytes.len() {
        if bytes[idx] == quote {
            if bytes.get(idx + 1) == Some(&quote) {
                idx += 2;
                continue;
            }
            return idx + 1;
        }
        idx += 1;
    }
    bytes.len()
}

/// Insert `LIMIT limit OFFSET offset` into `query` ahead of any trailing
/// clause. The offset is omitted when zero.
pub fn inject_limit_offset(query: &str, limit: u64, offset: u64, trailing: &[String]) -> String {
    let mut clause = format!("LIMIT {limit}");
    if offset > 0 {
        clause.push_str(&format!(" OFFSET {offset}"));
    }

    match find_trailing_clause(query, trailing) {
        Some(pos) => {
            let (head, tail) = query.split_at(pos);
            format!("{} {clause} {tail}", head.trim_end())
        }
        None => format!("{} {clause}", query.trim_end()),
    }
}
