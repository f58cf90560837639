//! Command templater: `%(NAME)` placeholder expansion over a variable map.
//!
//! Helper command lines are stored as argv templates. Each element may
//! contain any number of placeholders; the affixed forms
//! `%(before="text" NAME)` and `%(after="text" NAME)` only emit their
//! affix when the variable is present and non-empty, so options like
//! `-o a,b` disappear cleanly when no options are configured.

use std::collections::HashMap;

/// Expands templates against a variable map, collecting parse errors for
/// the caller to drain after each invocation.
pub struct Expander<'a> {
    map: &'a HashMap<String, String>,
    errors: Vec<String>,
}

impl<'a> Expander<'a> {
    pub fn new(map: &'a HashMap<String, String>) -> Self {
        Self {
            map,
            errors: Vec::new(),
        }
    }

    /// Expand a single template element. Malformed placeholders are
    /// recorded and skipped; the rest of the element still expands.
    pub fn expand(&mut self, template: &str) -> String {
        let bytes = template.as_bytes();
        let mut out = String::with_capacity(template.len());
        let mut idx = 0;

        while idx < bytes.len() {
            if bytes[idx] == b'%' && idx + 1 < bytes.len() && bytes[idx + 1] == b'(' {
                match self.parse_placeholder(template, idx + 2) {
                    Ok((expansion, next)) => {
                        out.push_str(&expansion);
                        idx = next;
                    }
                    Err(next) => idx = next,
                }
            } else {
                let ch = template[idx..].chars().next().expect("in-bounds index");
                out.push(ch);
                idx += ch.len_utf8();
            }
        }

        out
    }

    /// Build an argv by expanding each template element. Elements whose
    /// placeholders all collapse to nothing are dropped, matching the
    /// behaviour of affixed variables like `%(before="-o" OPTIONS)`.
    pub fn arglist(&mut self, templates: &[String]) -> Vec<String> {
        let mut argv = Vec::with_capacity(templates.len());
        for template in templates {
            let filled = self.expand(template);
            if filled.is_empty() && !template.is_empty() {
                continue;
            }
            argv.push(filled);
        }
        argv
    }

    /// Take the parse errors accumulated so far.
    pub fn drain_errors(&mut self) -> Vec<String> {
        std::mem::take(&mut self.errors)
    }

    /// Parse one placeholder starting just after `%(`. Returns the
    /// expansion and the index past the closing parenthesis, or the index
    /// to resume from after a malformed placeholder.
    fn parse_placeholder(&mut self, template: &str, start: usize) -> Result<(String, usize), usize> {
        let bytes = template.as_bytes();
        let mut idx = start;
        let mut before = String::new();
        let mut after = String::new();

        loop {
            while idx < bytes.len() && bytes[idx] == b' ' {
                idx += 1;
            }

            if template[idx..].starts_with("before=\"") {
                idx = self.parse_affix(template, idx + 8, &mut before)?;
            } else if template[idx..].starts_with("after=\"") {
                idx = self.parse_affix(template, idx + 7, &mut after)?;
            } else {
                break;
            }
        }

        let name_start = idx;
        while idx < bytes.len() && (bytes[idx].is_ascii_alphanumeric() || bytes[idx] == b'_') {
            idx += 1;
        }
        let name = &template[name_start..idx];

        while idx < bytes.len() && bytes[idx] == b' ' {
            idx += 1;
        }

        if idx >= bytes.len() || bytes[idx] != b')' {
            self.errors.push(format!(
                "unterminated placeholder near offset {} in {template:?}",
                name_start
            ));
            return Err(idx);
        }
        if name.is_empty() {
            self.errors
                .push(format!("placeholder without a key in {template:?}"));
            return Err(idx + 1);
        }

        let value = self.map.get(name).map(String::as_str).unwrap_or("");
        let expansion = if value.is_empty() {
            String::new()
        } else {
            format!("{before}{value}{after}")
        };
        Ok((expansion, idx + 1))
    }

    fn parse_affix(
        &mut self,
        template: &str,
        start: usize,
        out: &mut String,
    ) -> Result<usize, usize> {
        match template[start..].find('"') {
            Some(len) => {
                out.push_str(&template[start..start + len]);
                Ok(start + len + 1)
            }
            None => {
                self.errors
                    .push(format!("missing closing quote in {template:?}"));
                Err(template.len())
            }
        }
    }
}
