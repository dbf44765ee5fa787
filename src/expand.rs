//! Host pattern expansion
//!
//! Expands bracket notation into concrete host names:
//! `foo[01-03].idc[1,3]` becomes the Cartesian product of its groups in
//! left-to-right order. A group contains comma-separated items, each a
//! plain token or a numeric range `A-B`; zero-padded endpoints pad every
//! produced value to the wider endpoint.

use std::collections::HashSet;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExpandError {
    #[error("unbalanced brackets in pattern '{0}'")]
    UnbalancedBracket(String),

    #[error("empty group in pattern '{0}'")]
    EmptyGroup(String),

    #[error("reversed range '{range}' in pattern '{pattern}'")]
    ReversedRange { range: String, pattern: String },

    #[error("empty host pattern")]
    EmptyPattern,
}

/// Expand a single pattern into concrete host names.
///
/// Literal patterns expand to themselves. Expansion is deterministic and
/// order-preserving: groups vary rightmost-fastest.
pub fn expand(pattern: &str) -> Result<Vec<String>, ExpandError> {
    let pattern = pattern.trim();
    if pattern.is_empty() {
        return Err(ExpandError::EmptyPattern);
    }

    // Split the pattern into alternating literal and group segments.
    let mut segments: Vec<Vec<String>> = Vec::new();
    let mut literal = String::new();
    let mut chars = pattern.chars();

    while let Some(c) = chars.next() {
        match c {
            '[' => {
                let mut group = String::new();
                let mut closed = false;
                for g in chars.by_ref() {
                    match g {
                        ']' => {
                            closed = true;
                            break;
                        }
                        '[' => return Err(ExpandError::UnbalancedBracket(pattern.to_string())),
                        _ => group.push(g),
                    }
                }
                if !closed {
                    return Err(ExpandError::UnbalancedBracket(pattern.to_string()));
                }
                if !literal.is_empty() {
                    segments.push(vec![std::mem::take(&mut literal)]);
                }
                segments.push(expand_group(&group, pattern)?);
            }
            ']' => return Err(ExpandError::UnbalancedBracket(pattern.to_string())),
            _ => literal.push(c),
        }
    }
    if !literal.is_empty() {
        segments.push(vec![literal]);
    }

    // Cartesian product, left-to-right.
    let mut hosts = vec![String::new()];
    for segment in &segments {
        let mut next = Vec::with_capacity(hosts.len() * segment.len());
        for prefix in &hosts {
            for item in segment {
                next.push(format!("{prefix}{item}"));
            }
        }
        hosts = next;
    }

    Ok(hosts)
}

/// Expand a list of patterns and deduplicate, keeping first-seen order.
pub fn expand_all<S: AsRef<str>>(patterns: &[S]) -> Result<Vec<String>, ExpandError> {
    let mut seen = HashSet::new();
    let mut hosts = Vec::new();

    for pattern in patterns {
        for host in expand(pattern.as_ref())? {
            if seen.insert(host.clone()) {
                hosts.push(host);
            }
        }
    }

    Ok(hosts)
}

fn expand_group(group: &str, pattern: &str) -> Result<Vec<String>, ExpandError> {
    if group.trim().is_empty() {
        return Err(ExpandError::EmptyGroup(pattern.to_string()));
    }

    let mut items = Vec::new();
    for item in group.split(',') {
        let item = item.trim();
        if item.is_empty() {
            return Err(ExpandError::EmptyGroup(pattern.to_string()));
        }

        match parse_numeric_range(item) {
            Some((lo, hi, width)) => {
                if lo > hi {
                    return Err(ExpandError::ReversedRange {
                        range: item.to_string(),
                        pattern: pattern.to_string(),
                    });
                }
                for n in lo..=hi {
                    if width > 0 {
                        items.push(format!("{n:0width$}"));
                    } else {
                        items.push(n.to_string());
                    }
                }
            }
            None => items.push(item.to_string()),
        }
    }

    Ok(items)
}

/// Parse `A-B` where both sides are decimal. Returns the bounds plus the
/// pad width (0 when neither endpoint is zero-padded). Items that are not
/// a numeric range, e.g. `web-a`, are plain tokens.
fn parse_numeric_range(item: &str) -> Option<(u64, u64, usize)> {
    let (a, b) = item.split_once('-')?;
    if a.is_empty() || b.is_empty() {
        return None;
    }
    if !a.bytes().all(|c| c.is_ascii_digit()) || !b.bytes().all(|c| c.is_ascii_digit()) {
        return None;
    }

    let lo: u64 = a.parse().ok()?;
    let hi: u64 = b.parse().ok()?;

    let padded = (a.len() > 1 && a.starts_with('0')) || (b.len() > 1 && b.starts_with('0'));
    let width = if padded { a.len().max(b.len()) } else { 0 };

    Some((lo, hi, width))
}
