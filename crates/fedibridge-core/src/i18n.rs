//! Localized message catalog.
//!
//! The catalog is a plain directory: one ordered keys file
//! (`bridge-messages-keys.txt`, one key per line) and one file per language
//! (`en.txt`, `fr.txt`, ...) whose lines carry the values in the same order.
//! Lines may carry a trailing `# comment`; every value gets two newlines
//! appended so fragments can be concatenated into replies directly.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use tracing::warn;

use crate::error::ConfigError;

/// Name of the ordered keys file inside the translation directory.
pub const KEYS_FILE: &str = "bridge-messages-keys.txt";

/// In-memory catalog: `key -> lang -> text`.
#[derive(Debug, Clone, Default)]
pub struct Messages {
    table: HashMap<String, HashMap<String, String>>,
    languages: Vec<String>,
}

fn strip_comment(line: &str) -> &str {
    match line.split_once("# ") {
        Some((head, _)) => head,
        None => line,
    }
}

impl Messages {
    /// Load the catalog from a translation directory.
    pub fn load(dir: &Path) -> Result<Messages, ConfigError> {
        let keys_path = dir.join(KEYS_FILE);
        let raw = fs::read_to_string(&keys_path).map_err(|e| {
            ConfigError::Translations(format!("cannot read {}: {}", keys_path.display(), e))
        })?;
        let keys: Vec<String> = raw
            .lines()
            .map(|l| strip_comment(l).trim())
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect();
        if keys.is_empty() {
            return Err(ConfigError::Translations(format!(
                "{} holds no keys",
                keys_path.display()
            )));
        }

        let mut table: HashMap<String, HashMap<String, String>> =
            keys.iter().map(|k| (k.clone(), HashMap::new())).collect();
        let mut languages = Vec::new();

        let entries = fs::read_dir(dir).map_err(|e| {
            ConfigError::Translations(format!("cannot read {}: {}", dir.display(), e))
        })?;
        for entry in entries {
            let entry =
                entry.map_err(|e| ConfigError::Translations(format!("bad dir entry: {}", e)))?;
            let path = entry.path();
            if !path.is_file() || path.file_name().is_some_and(|n| n == KEYS_FILE) {
                continue;
            }
            let lang = match path.file_stem().and_then(|s| s.to_str()) {
                Some(stem) => stem.to_string(),
                None => continue,
            };
            let raw = fs::read_to_string(&path).map_err(|e| {
                ConfigError::Translations(format!("cannot read {}: {}", path.display(), e))
            })?;
            let values: Vec<String> = raw
                .lines()
                .map(|l| strip_comment(l).trim())
                .filter(|l| !l.is_empty())
                .map(|l| format!("{}\n\n", l.replace("\\n", "\n")))
                .collect();
            if values.len() < keys.len() {
                warn!(
                    lang = %lang,
                    have = values.len(),
                    want = keys.len(),
                    "translation file is missing values"
                );
            }
            for (key, value) in keys.iter().zip(values) {
                if let Some(per_lang) = table.get_mut(key) {
                    per_lang.insert(lang.clone(), value);
                }
            }
            languages.push(lang);
        }
        languages.sort();

        if languages.is_empty() {
            return Err(ConfigError::Translations(format!(
                "{} holds no language files",
                dir.display()
            )));
        }

        Ok(Messages { table, languages })
    }

    /// Languages for which a value file was loaded.
    pub fn languages(&self) -> &[String] {
        &self.languages
    }

    /// True if `lang` is one of the loaded languages.
    pub fn has_language(&self, lang: &str) -> bool {
        self.languages.iter().any(|l| l == lang)
    }

    /// Fetch the text for `key` in `lang`, falling back to any loaded
    /// language. An unknown key resolves to an empty string with a warning
    /// rather than a panic: the catalog is operator-editable.
    pub fn text(&self, key: &str, lang: &str) -> String {
        let Some(per_lang) = self.table.get(key) else {
            warn!(key, "unknown message key");
            return String::new();
        };
        if let Some(value) = per_lang.get(lang) {
            return value.clone();
        }
        for l in &self.languages {
            if let Some(value) = per_lang.get(l) {
                return value.clone();
            }
        }
        warn!(key, lang, "message key has no translation");
        String::new()
    }

    /// Fetch and fill positional `{}` placeholders, in order.
    pub fn fill(&self, key: &str, lang: &str, args: &[&str]) -> String {
        fill(&self.text(key, lang), args)
    }
}

/// Replace each successive `{}` in `template` with the matching argument.
/// Surplus placeholders stay verbatim; surplus arguments are dropped.
pub fn fill(template: &str, args: &[&str]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    let mut args = args.iter();
    while let Some(pos) = rest.find("{}") {
        out.push_str(&rest[..pos]);
        match args.next() {
            Some(arg) => out.push_str(arg),
            None => out.push_str("{}"),
        }
        rest = &rest[pos + 2..];
    }
    out.push_str(rest);
    out
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write_catalog(dir: &Path) {
        fs::write(
            dir.join(KEYS_FILE),
            "regok # sent on successful registration\nhelp\nstop\n",
        )
        .unwrap();
        fs::write(
            dir.join("en.txt"),
            "You are registered. # reg\nCommands:\\nuse {} wisely\nBridge halted\n",
        )
        .unwrap();
        fs::write(dir.join("fr.txt"), "Vous êtes inscrit.\nCommandes : {}\nPont arrêté\n").unwrap();
    }

    #[test]
    fn loads_keys_and_languages() {
        let dir = tempfile::tempdir().unwrap();
        write_catalog(dir.path());
        let messages = Messages::load(dir.path()).unwrap();
        assert_eq!(messages.languages(), ["en", "fr"]);
        assert_eq!(messages.text("regok", "en"), "You are registered.\n\n");
        assert_eq!(messages.text("regok", "fr"), "Vous êtes inscrit.\n\n");
    }

    #[test]
    fn values_expand_escaped_newlines_and_placeholders() {
        let dir = tempfile::tempdir().unwrap();
        write_catalog(dir.path());
        let messages = Messages::load(dir.path()).unwrap();
        assert_eq!(
            messages.fill("help", "en", &["!"]),
            "Commands:\nuse ! wisely\n\n"
        );
    }

    #[test]
    fn unknown_language_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        write_catalog(dir.path());
        let messages = Messages::load(dir.path()).unwrap();
        assert_eq!(messages.text("stop", "de"), "Bridge halted\n\n");
        assert!(!messages.has_language("de"));
    }

    #[test]
    fn fill_handles_arity_mismatch() {
        assert_eq!(fill("a {} b {}", &["x"]), "a x b {}");
        assert_eq!(fill("a {}", &["x", "y"]), "a x");
        assert_eq!(fill("no holes", &[]), "no holes");
    }
}
