//! Variable substitution for commands, paths and function arguments.
//!
//! Templates reference variables as `$NAME` or `${NAME}`. Names that are not
//! present in the mapping are left in place so a later pass (or the shell the
//! command runs under) can still resolve them.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::{Captures, Regex};

/// A resolved set of environment variables, ordered by key.
pub type Environment = BTreeMap<String, String>;

const FALLBACK_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

fn token_regex() -> &'static Regex {
    static TOKEN: OnceLock<Regex> = OnceLock::new();
    TOKEN.get_or_init(|| {
        Regex::new(r"\$(?:\{([A-Za-z_][A-Za-z0-9_]*)\}|([A-Za-z_][A-Za-z0-9_]*))")
            .expect("variable token pattern is valid")
    })
}

/// Expands every `$NAME` / `${NAME}` token whose name is in `vars`.
pub fn replace_vars(template: &str, vars: &Environment) -> String {
    if !template.contains('$') {
        return template.to_string();
    }
    token_regex()
        .replace_all(template, |caps: &Captures| {
            let name = caps
                .get(1)
                .or_else(|| caps.get(2))
                .map(|m| m.as_str())
                .unwrap_or_default();
            match vars.get(name) {
                Some(value) => value.clone(),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

/// Seeds the entries every task environment needs to be usable once the
/// child's environment has been cleared. Existing keys are never replaced.
pub fn add_default_vars(mut env: Environment) -> Environment {
    if !env.contains_key("PATH") {
        let path = std::env::var("PATH").unwrap_or_else(|_| FALLBACK_PATH.to_string());
        env.insert("PATH".to_string(), path);
    }
    if !env.contains_key("HOME") {
        if let Ok(home) = std::env::var("HOME") {
            env.insert("HOME".to_string(), home);
        }
    }
    env
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> Environment {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn replaces_plain_and_braced_tokens() {
        let vars = env(&[("TASK", "build"), ("WORKSPACE", "w1"), ("OUT", "/tmp")]);
        assert_eq!(
            replace_vars("echo $TASK in ${WORKSPACE} > $OUT/log", &vars),
            "echo build in w1 > /tmp/log"
        );
    }

    #[test]
    fn leaves_unknown_tokens_alone() {
        let vars = env(&[("TASK", "build")]);
        assert_eq!(replace_vars("$TASK $MISSING ${ALSO}", &vars), "build $MISSING ${ALSO}");
    }

    #[test]
    fn matches_the_longest_name() {
        let vars = env(&[("TASK", "short"), ("TASK_ID", "7")]);
        assert_eq!(replace_vars("$TASK_ID/$TASK", &vars), "7/short");
    }

    #[test]
    fn no_tokens_left_for_known_keys() {
        let vars = env(&[("A", "1"), ("B", "2"), ("C", "3")]);
        let out = replace_vars("$A-${B}-$C $A", &vars);
        assert_eq!(out, "1-2-3 1");
        assert!(!out.contains('$'));
    }

    #[test]
    fn default_vars_do_not_overwrite() {
        let seeded = add_default_vars(env(&[("PATH", "/custom")]));
        assert_eq!(seeded.get("PATH").map(String::as_str), Some("/custom"));

        let seeded = add_default_vars(Environment::new());
        assert!(seeded.contains_key("PATH"));
    }
}
