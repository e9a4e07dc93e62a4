//! Explicit key/value context used as the configuration transport
//!
//! Configuration is decoded from an `EnvContext` instead of the live process
//! environment so concurrent loads never observe each other's overrides.

use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvContext {
    vars: BTreeMap<String, String>,
}

impl EnvContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot the current process environment (non UTF-8 entries are skipped)
    pub fn from_process() -> Self {
        let vars = std::env::vars_os()
            .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?)))
            .collect();
        Self { vars }
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            vars: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.vars.contains_key(key)
    }

    /// Set a variable, returning its previous value
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        self.vars.insert(key.into(), value.into())
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.vars.remove(key)
    }

    /// Keys starting with the given prefix, in sorted order
    pub fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.vars
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect()
    }

    pub fn has_prefix(&self, prefix: &str) -> bool {
        self.vars
            .range(prefix.to_string()..)
            .next()
            .is_some_and(|(k, _)| k.starts_with(prefix))
    }

    /// Layer the given variables on top of this context
    pub fn overlay<I, K, V>(&mut self, vars: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        for (k, v) in vars {
            self.vars.insert(k.into(), v.into());
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    /// Replace `$VAR` and `${VAR}` references; unknown variables expand to
    /// an empty string
    pub fn expand(&self, input: &str) -> String {
        let mut out = String::with_capacity(input.len());
        let mut rest = input;

        while let Some(pos) = rest.find('$') {
            out.push_str(&rest[..pos]);
            let after = &rest[pos + 1..];

            if let Some(braced) = after.strip_prefix('{') {
                if let Some(end) = braced.find('}') {
                    out.push_str(self.get(&braced[..end]).unwrap_or_default());
                    rest = &braced[end + 1..];
                    continue;
                }
            } else {
                let name_len = after
                    .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
                    .unwrap_or(after.len());
                if name_len > 0 {
                    out.push_str(self.get(&after[..name_len]).unwrap_or_default());
                    rest = &after[name_len..];
                    continue;
                }
            }

            out.push('$');
            rest = after;
        }

        out.push_str(rest);
        out
    }
}

/// Parse dotenv formatted content into ordered key/value pairs
///
/// Supports comments, an optional `export ` prefix, single quoted literals and
/// double quoted values with `\n`, `\"` and `\\` escapes.
pub fn parse_dotenv(content: &str) -> Result<Vec<(String, String)>, String> {
    let mut pairs = Vec::new();

    for (index, raw) in content.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line);

        let (key, value) = line
            .split_once('=')
            .ok_or_else(|| format!("line {}: expected KEY=VALUE", index + 1))?;
        let key = key.trim();
        if key.is_empty() || key.contains(char::is_whitespace) {
            return Err(format!("line {}: invalid key `{}`", index + 1, key));
        }

        let value = value.trim();
        let value = if let Some(quoted) = value.strip_prefix('\'') {
            let end = quoted
                .find('\'')
                .ok_or_else(|| format!("line {}: unterminated single quote", index + 1))?;
            quoted[..end].to_string()
        } else if let Some(quoted) = value.strip_prefix('"') {
            unescape_double_quoted(quoted)
                .ok_or_else(|| format!("line {}: unterminated double quote", index + 1))?
        } else {
            match value.find(" #") {
                Some(comment) => value[..comment].trim_end().to_string(),
                None => value.to_string(),
            }
        };

        pairs.push((key.to_string(), value));
    }

    Ok(pairs)
}

fn unescape_double_quoted(input: &str) -> Option<String> {
    let mut out = String::new();
    let mut chars = input.chars();
    while let Some(c) = chars.next() {
        match c {
            '"' => return Some(out),
            '\\' => match chars.next()? {
                'n' => out.push('\n'),
                't' => out.push('\t'),
                other => out.push(other),
            },
            other => out.push(other),
        }
    }
    None
}
