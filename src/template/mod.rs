// Template rendering: {{var}} expansion over a layered string context.
//
// Placeholders are either variable lookups ({{NAME}}) or helper calls
// ({{randomInt(1, 100)}}). Anything that fails to resolve is left in the
// output untouched so config authors can spot the problem.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// A flat string->string context plus the run-wide seeded RNG used by the
/// random/faker helpers.
#[derive(Clone)]
pub(crate) struct TemplateContext {
    vars: HashMap<String, String>,
    rng: Arc<Mutex<StdRng>>,
}

impl TemplateContext {
    /// Build the base context: process environment, then the static run
    /// values, then user-supplied variables. Later layers shadow earlier.
    pub fn new(seed: u64, variables: &HashMap<String, String>) -> Self {
        let mut vars: HashMap<String, String> = std::env::vars().collect();
        vars.insert("RUN_ID".to_string(), uuid::Uuid::new_v4().to_string());
        vars.insert(
            "TEMP_DIR".to_string(),
            std::env::temp_dir().to_string_lossy().to_string(),
        );
        for (k, v) in variables {
            vars.insert(k.clone(), v.clone());
        }
        Self {
            vars,
            rng: Arc::new(Mutex::new(StdRng::seed_from_u64(seed))),
        }
    }

    /// Record the directory containing the config file being processed.
    pub fn set_test_dir(&mut self, dir: &str) {
        self.vars.insert("TEST_DIR".to_string(), dir.to_string());
    }

    pub fn set(&mut self, name: &str, value: &str) {
        self.vars.insert(name.to_string(), value.to_string());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }

    /// A child context with extra variables layered on top. Shares the RNG.
    pub fn with_vars(&self, extra: &HashMap<String, String>) -> Self {
        let mut child = self.clone();
        for (k, v) in extra {
            child.vars.insert(k.clone(), v.clone());
        }
        child
    }

    /// Expand every {{...}} placeholder in `input`.
    pub fn render(&self, input: &str) -> String {
        let mut out = String::with_capacity(input.len());
        let mut rest = input;

        while let Some(start) = rest.find("{{") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            match after.find("}}") {
                Some(end) => {
                    let inner = after[..end].trim();
                    match self.resolve(inner) {
                        Some(value) => out.push_str(&value),
                        None => {
                            // Unknown variable or bad helper call: keep as-is.
                            out.push_str(&rest[start..start + 2 + end + 2]);
                        }
                    }
                    rest = &after[end + 2..];
                }
                None => {
                    // Unterminated placeholder: emit the remainder verbatim.
                    out.push_str(&rest[start..]);
                    return out;
                }
            }
        }
        out.push_str(rest);
        out
    }

    /// Resolve one placeholder body: a helper call or a variable name.
    fn resolve(&self, inner: &str) -> Option<String> {
        if let Some(open) = inner.find('(') {
            if inner.ends_with(')') {
                let name = inner[..open].trim();
                let args = split_args(&inner[open + 1..inner.len() - 1]);
                return self.call_helper(name, &args);
            }
            return None;
        }
        self.vars.get(inner).cloned()
    }

    fn call_helper(&self, name: &str, args: &[String]) -> Option<String> {
        let arg = |i: usize| -> Option<String> { args.get(i).map(|a| self.resolve_arg(a)) };

        match name {
            "randomValue" => {
                let len = arg(0)
                    .and_then(|a| a.parse::<usize>().ok())
                    .unwrap_or(8);
                let mut rng = self.rng.lock();
                Some(
                    (0..len)
                        .map(|_| rng.sample(rand::distributions::Alphanumeric) as char)
                        .collect(),
                )
            }
            "randomInt" => {
                let min: i64 = arg(0)?.parse().ok()?;
                let max: i64 = arg(1)?.parse().ok()?;
                if min > max {
                    return None;
                }
                Some(self.rng.lock().gen_range(min..=max).to_string())
            }
            "randomDecimal" => {
                let min: f64 = arg(0)?.parse().ok()?;
                let max: f64 = arg(1)?.parse().ok()?;
                if min > max {
                    return None;
                }
                if min == max {
                    return Some(format!("{min:.2}"));
                }
                Some(format!("{:.2}", self.rng.lock().gen_range(min..max)))
            }
            "now" => match arg(0) {
                Some(fmt) if !fmt.is_empty() => Some(Utc::now().format(&fmt).to_string()),
                _ => Some(Utc::now().to_rfc3339()),
            },
            "faker" => self.fake(arg(0)?.as_str()),
            "cut" => Some(arg(0)?.replace(&arg(1)?, "")),
            "replace" => Some(arg(0)?.replace(&arg(1)?, &arg(2)?)),
            "substring" => {
                let s = arg(0)?;
                let start: usize = arg(1)?.parse().ok()?;
                let chars: Vec<char> = s.chars().collect();
                let end = match arg(2) {
                    Some(e) => e.parse::<usize>().ok()?.min(chars.len()),
                    None => chars.len(),
                };
                if start > end {
                    return None;
                }
                Some(chars[start..end].iter().collect())
            }
            _ => None,
        }
    }

    /// A helper argument is a quoted literal, a context variable, or itself.
    fn resolve_arg(&self, raw: &str) -> String {
        let trimmed = raw.trim();
        if (trimmed.starts_with('"') && trimmed.ends_with('"') && trimmed.len() >= 2)
            || (trimmed.starts_with('\'') && trimmed.ends_with('\'') && trimmed.len() >= 2)
        {
            return trimmed[1..trimmed.len() - 1].to_string();
        }
        match self.vars.get(trimmed) {
            Some(v) => v.clone(),
            None => trimmed.to_string(),
        }
    }

    fn fake(&self, kind: &str) -> Option<String> {
        const FIRST: &[&str] = &[
            "alice", "bob", "carol", "dave", "erin", "frank", "grace", "heidi",
        ];
        const LAST: &[&str] = &[
            "smith", "jones", "brown", "wilson", "taylor", "moore", "clark", "hall",
        ];
        const WORDS: &[&str] = &[
            "amber", "basin", "cedar", "delta", "ember", "flint", "grove", "harbor",
            "inlet", "juniper", "kestrel", "lumen",
        ];
        let mut rng = self.rng.lock();
        match kind {
            "name" => {
                let first = FIRST[rng.gen_range(0..FIRST.len())];
                let last = LAST[rng.gen_range(0..LAST.len())];
                Some(format!("{} {}", capitalize(first), capitalize(last)))
            }
            "email" => {
                let first = FIRST[rng.gen_range(0..FIRST.len())];
                let last = LAST[rng.gen_range(0..LAST.len())];
                let n: u16 = rng.gen_range(1..100);
                Some(format!("{first}.{last}{n}@example.com"))
            }
            "word" => Some(WORDS[rng.gen_range(0..WORDS.len())].to_string()),
            "uuid" => Some(uuid::Uuid::new_v4().to_string()),
            _ => None,
        }
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) => c.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

/// Split helper arguments on commas, respecting single and double quotes.
fn split_args(input: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;

    for c in input.chars() {
        match quote {
            Some(q) => {
                current.push(c);
                if c == q {
                    quote = None;
                }
            }
            None => match c {
                '"' | '\'' => {
                    quote = Some(c);
                    current.push(c);
                }
                ',' => {
                    args.push(current.trim().to_string());
                    current.clear();
                }
                _ => current.push(c),
            },
        }
    }
    if !current.trim().is_empty() || !args.is_empty() {
        args.push(current.trim().to_string());
    }
    args
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> TemplateContext {
        let mut vars = HashMap::new();
        vars.insert("NAME".to_string(), "world".to_string());
        vars.insert("ITEM_ID".to_string(), "42".to_string());
        TemplateContext::new(7, &vars)
    }

    #[test]
    fn test_render_plain() {
        assert_eq!(ctx().render("no placeholders"), "no placeholders");
    }

    #[test]
    fn test_render_variable() {
        assert_eq!(ctx().render("hello {{NAME}}"), "hello world");
    }

    #[test]
    fn test_render_unknown_left_untouched() {
        assert_eq!(ctx().render("x {{MISSING}} y"), "x {{MISSING}} y");
    }

    #[test]
    fn test_render_unterminated() {
        assert_eq!(ctx().render("x {{OOPS"), "x {{OOPS");
    }

    #[test]
    fn test_render_multiple() {
        assert_eq!(ctx().render("{{NAME}}-{{ITEM_ID}}"), "world-42");
    }

    #[test]
    fn test_env_layer_present() {
        // HOME or PATH is set in any test environment.
        let c = TemplateContext::new(1, &HashMap::new());
        assert!(c.get("PATH").is_some() || c.get("HOME").is_some());
    }

    #[test]
    fn test_static_context() {
        let c = TemplateContext::new(1, &HashMap::new());
        assert_eq!(c.get("RUN_ID").unwrap().len(), 36);
        assert!(!c.get("TEMP_DIR").unwrap().is_empty());
    }

    #[test]
    fn test_variables_shadow_env() {
        let mut vars = HashMap::new();
        vars.insert("PATH".to_string(), "custom".to_string());
        let c = TemplateContext::new(1, &vars);
        assert_eq!(c.get("PATH"), Some("custom"));
    }

    #[test]
    fn test_random_int_in_range() {
        let c = ctx();
        for _ in 0..50 {
            let v: i64 = c.render("{{randomInt(1, 6)}}").parse().unwrap();
            assert!((1..=6).contains(&v));
        }
    }

    #[test]
    fn test_random_int_deterministic_under_seed() {
        let a = TemplateContext::new(99, &HashMap::new()).render("{{randomInt(0, 1000000)}}");
        let b = TemplateContext::new(99, &HashMap::new()).render("{{randomInt(0, 1000000)}}");
        assert_eq!(a, b);
    }

    #[test]
    fn test_random_value_length() {
        assert_eq!(ctx().render("{{randomValue(12)}}").len(), 12);
        assert_eq!(ctx().render("{{randomValue()}}").len(), 8);
    }

    #[test]
    fn test_random_decimal_format() {
        let v = ctx().render("{{randomDecimal(1.0, 2.0)}}");
        let f: f64 = v.parse().unwrap();
        assert!((1.0..2.01).contains(&f));
        assert!(v.contains('.'));
    }

    #[test]
    fn test_now_default_is_rfc3339() {
        let v = ctx().render("{{now()}}");
        assert!(chrono::DateTime::parse_from_rfc3339(&v).is_ok());
    }

    #[test]
    fn test_now_custom_format() {
        let v = ctx().render("{{now(\"%Y\")}}");
        assert_eq!(v.len(), 4);
        assert!(v.parse::<u32>().unwrap() >= 2024);
    }

    #[test]
    fn test_cut() {
        assert_eq!(ctx().render("{{cut(\"a-b-c\", \"-\")}}"), "abc");
    }

    #[test]
    fn test_replace() {
        assert_eq!(ctx().render("{{replace(\"a.b\", \".\", \"/\")}}"), "a/b");
    }

    #[test]
    fn test_substring() {
        assert_eq!(ctx().render("{{substring(\"abcdef\", 1, 4)}}"), "bcd");
        assert_eq!(ctx().render("{{substring(\"abcdef\", 3)}}"), "def");
        // End clamped to length.
        assert_eq!(ctx().render("{{substring(\"ab\", 0, 99)}}"), "ab");
    }

    #[test]
    fn test_helper_args_resolve_variables() {
        assert_eq!(ctx().render("{{replace(NAME, \"o\", \"0\")}}"), "w0rld");
    }

    #[test]
    fn test_bad_helper_left_untouched() {
        assert_eq!(ctx().render("{{randomInt(9, 1)}}"), "{{randomInt(9, 1)}}");
        assert_eq!(ctx().render("{{nosuch(1)}}"), "{{nosuch(1)}}");
    }

    #[test]
    fn test_faker_email_shape() {
        let v = ctx().render("{{faker(\"email\")}}");
        assert!(v.contains('@'));
        assert!(v.ends_with("example.com"));
    }

    #[test]
    fn test_faker_uuid() {
        let v = ctx().render("{{faker(\"uuid\")}}");
        assert_eq!(v.len(), 36);
    }

    #[test]
    fn test_split_args_quoted_comma() {
        let args = split_args("\"a,b\", c");
        assert_eq!(args, vec!["\"a,b\"", "c"]);
    }

    #[test]
    fn test_with_vars_layering() {
        let base = ctx();
        let mut extra = HashMap::new();
        extra.insert("NAME".to_string(), "shadowed".to_string());
        let child = base.with_vars(&extra);
        assert_eq!(child.render("{{NAME}}"), "shadowed");
        assert_eq!(base.render("{{NAME}}"), "world");
    }
}
