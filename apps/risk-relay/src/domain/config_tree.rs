//! Config Tree
//!
//! Ordered, nested `key = value` documents with bracketed section headers.
//! The header depth is the number of leading brackets: `[a]` opens a
//! section under the root, `[[b]]` opens a section under the most recent
//! depth-1 section, and so on.
//!
//! ```text
//! accounts = 1, 2
//! [Exposure]
//! gross = sum(abs(Pos * Close))
//! [[Detail]]
//! net = sum(Pos * Close)
//! ```
//!
//! Values and sections keep their file order, and every entry records the
//! 1-based line it came from so that formula errors can point at it.

use std::fmt::Write as _;

// =============================================================================
// Error Type
// =============================================================================

/// Config tree parse errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigTreeError {
    /// A line could not be placed in the tree.
    #[error("invalid INI syntax on line {line}: {message}")]
    Syntax {
        /// 1-based source line.
        line: usize,
        /// What was wrong with it.
        message: String,
    },
}

impl ConfigTreeError {
    fn syntax(line: usize, message: impl Into<String>) -> Self {
        Self::Syntax {
            line,
            message: message.into(),
        }
    }

    /// Line the error was raised on.
    #[must_use]
    pub const fn line(&self) -> usize {
        match self {
            Self::Syntax { line, .. } => *line,
        }
    }
}

// =============================================================================
// Tree Types
// =============================================================================

/// A single `key = value` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigValue {
    /// Key, trimmed.
    pub key: String,
    /// Value, trimmed.
    pub value: String,
    /// 1-based source line.
    pub line: usize,
}

/// A named section with ordered values and child sections.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConfigSection {
    name: String,
    line: usize,
    values: Vec<ConfigValue>,
    sections: Vec<ConfigSection>,
}

impl ConfigSection {
    fn new(name: String, line: usize) -> Self {
        Self {
            name,
            line,
            values: Vec::new(),
            sections: Vec::new(),
        }
    }

    /// Section name (empty for the root).
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Line of the section header (0 for the root).
    #[must_use]
    pub const fn line(&self) -> usize {
        self.line
    }

    /// Values in file order.
    #[must_use]
    pub fn values(&self) -> &[ConfigValue] {
        &self.values
    }

    /// Child sections in file order.
    #[must_use]
    pub fn sections(&self) -> &[Self] {
        &self.sections
    }

    /// Look up a value by key.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&ConfigValue> {
        self.values.iter().find(|v| v.key == key)
    }

    /// Look up a child section by name.
    #[must_use]
    pub fn section(&self, name: &str) -> Option<&Self> {
        self.sections.iter().find(|s| s.name == name)
    }

    fn write_to(&self, depth: usize, out: &mut String) {
        if depth > 0 {
            let open = "[".repeat(depth);
            let close = "]".repeat(depth);
            let _ = writeln!(out, "{open}{}{close}", self.name);
        }
        for value in &self.values {
            let _ = writeln!(out, "{} = {}", value.key, value.value);
        }
        for child in &self.sections {
            child.write_to(depth + 1, out);
        }
    }
}

/// A parsed document. The root section holds keys that appear before the
/// first header.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConfigTree {
    root: ConfigSection,
}

impl ConfigTree {
    /// Parse document text.
    ///
    /// # Errors
    ///
    /// Returns `ConfigTreeError::Syntax` when a header skips a nesting level,
    /// a section name repeats under the same parent, a key repeats within a
    /// section, or a header is malformed.
    pub fn parse(text: &str) -> Result<Self, ConfigTreeError> {
        // stack[0] is the root; stack[d] is the open section at depth d.
        let mut stack = vec![ConfigSection::default()];

        for (index, raw) in text.lines().enumerate() {
            let line_no = index + 1;
            let line = raw.trim_matches(|c| matches!(c, ' ' | '\t' | '\r' | '\n'));

            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }

            if line.starts_with('[') {
                let (depth, name) = parse_header(line, line_no)?;
                let current = stack.len() - 1;
                if depth > current + 1 {
                    return Err(ConfigTreeError::syntax(line_no, "section with wrong depth"));
                }
                close_to(&mut stack, depth);
                let parent = stack.last().ok_or_else(|| {
                    ConfigTreeError::syntax(line_no, "section with wrong depth")
                })?;
                if parent.section(&name).is_some() {
                    return Err(ConfigTreeError::syntax(
                        line_no,
                        "duplicate section name on the same level",
                    ));
                }
                stack.push(ConfigSection::new(name, line_no));
                continue;
            }

            let Some(pos) = line.find('=') else {
                continue;
            };
            if pos == 0 {
                continue;
            }
            let key = line[..pos].trim().to_string();
            let value = line[pos + 1..].trim().to_string();

            let Some(section) = stack.last_mut() else {
                continue;
            };
            if section.get(&key).is_some() {
                return Err(ConfigTreeError::syntax(
                    line_no,
                    "duplicate key on the same level",
                ));
            }
            section.values.push(ConfigValue {
                key,
                value,
                line: line_no,
            });
        }

        close_to(&mut stack, 1);
        let root = stack.pop().unwrap_or_default();
        Ok(Self { root })
    }

    /// The root section.
    #[must_use]
    pub const fn root(&self) -> &ConfigSection {
        &self.root
    }

    /// Serialize back to text in original order.
    #[must_use]
    pub fn to_text(&self) -> String {
        let mut out = String::new();
        self.root.write_to(0, &mut out);
        out
    }
}

/// Fold open sections into their parents until `len` entries remain.
fn close_to(stack: &mut Vec<ConfigSection>, len: usize) {
    while stack.len() > len {
        if let Some(done) = stack.pop()
            && let Some(parent) = stack.last_mut()
        {
            parent.sections.push(done);
        }
    }
}

fn parse_header(line: &str, line_no: usize) -> Result<(usize, String), ConfigTreeError> {
    let depth = line.chars().take_while(|&c| c == '[').count();
    let closing = line.chars().rev().take_while(|&c| c == ']').count();
    if closing != depth || line.len() < depth * 2 {
        return Err(ConfigTreeError::syntax(line_no, "unbalanced section brackets"));
    }
    let name = line[depth..line.len() - depth].trim();
    if name.is_empty() {
        return Err(ConfigTreeError::syntax(line_no, "empty section name"));
    }
    Ok((depth, name.to_string()))
}

// =============================================================================
// Tests
// =============================================================================
