// ABOUTME: Defensive parser for `ls -la` output produced inside a sandbox
// ABOUTME: Field positions are fixed up to the name, which is taken verbatim so embedded spaces survive

use super::NodeKind;

/// One parsed `ls -la` row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingEntry {
    pub name: String,
    pub kind: NodeKind,
    pub size: u64,
    pub permissions: String,
    pub target: Option<String>,
}

/// Fields preceding the name: mode, links, owner, group, size, month, day, time-or-year
const FIELDS_BEFORE_NAME: usize = 8;

/// Parse every entry row, skipping the summary line, `.` and `..`, and anything unrecognisable
pub fn parse_listing(output: &str) -> Vec<ListingEntry> {
    output.lines().filter_map(parse_line).collect()
}

pub fn parse_line(raw: &str) -> Option<ListingEntry> {
    let line = strip_control(raw);
    let line = line.trim_end();
    if line.is_empty() || line.starts_with("total ") {
        return None;
    }

    let (first, _) = split_fields(line, 1)?;
    let permissions = first[0];
    let kind = kind_from_mode(permissions)?;

    // Device nodes show "major, minor" where the size would be
    let (fields, rest) = split_fields(line, FIELDS_BEFORE_NAME)?;
    let (fields, rest) = if fields[4].ends_with(',') {
        split_fields(line, FIELDS_BEFORE_NAME + 1)?
    } else {
        (fields, rest)
    };

    let size = if fields[4].ends_with(',') {
        0
    } else {
        fields[4].parse::<u64>().ok()?
    };

    let (name, target) = match kind {
        NodeKind::Symlink => match rest.split_once(" -> ") {
            Some((name, target)) => (name.to_string(), Some(target.to_string())),
            None => (rest.to_string(), None),
        },
        _ => (rest.to_string(), None),
    };

    if name.is_empty() || name == "." || name == ".." {
        return None;
    }

    Some(ListingEntry {
        name,
        kind,
        size,
        permissions: permissions.to_string(),
        target,
    })
}

fn kind_from_mode(mode: &str) -> Option<NodeKind> {
    if mode.len() < 10 {
        return None;
    }
    match mode.chars().next()? {
        'd' => Some(NodeKind::Directory),
        'l' => Some(NodeKind::Symlink),
        '-' | 'c' | 'b' | 'p' | 's' => Some(NodeKind::File),
        _ => None,
    }
}

/// Take `n` whitespace-separated fields and return them with the untouched remainder
fn split_fields(line: &str, n: usize) -> Option<(Vec<&str>, &str)> {
    let mut fields = Vec::with_capacity(n);
    let mut rest = line;
    for _ in 0..n {
        rest = rest.trim_start();
        if rest.is_empty() {
            return None;
        }
        let end = rest.find(char::is_whitespace).unwrap_or(rest.len());
        fields.push(&rest[..end]);
        rest = &rest[end..];
    }
    // Exactly one separator precedes the name; further spaces belong to it
    let rest = rest
        .strip_prefix(|c: char| c == ' ' || c == '\t')
        .unwrap_or(rest);
    Some((fields, rest))
}

/// Drop ANSI escape sequences and other control characters
fn strip_control(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut chars = line.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\u{1b}' {
            if chars.peek() == Some(&'[') {
                chars.next();
                // CSI sequence runs up to a final byte in @..~
                for next in chars.by_ref() {
                    if ('@'..='~').contains(&next) {
                        break;
                    }
                }
            }
            continue;
        }
        if c.is_control() && c != '\t' {
            continue;
        }
        out.push(c);
    }
    out
}
