//! Glossary templates: `key_template → value_template` with `{{name}}` and
//! `{{name:regex}}` placeholders. A name repeated in a key becomes a back-reference,
//! so `"{{a}} and {{a}}"` only matches when both spans are identical.
//!
//! Rules are tried in insertion order; the first full-string match wins. If no
//! compiled rule matches, the raw text is looked up as an exact key.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, OnceLock};

use indexmap::IndexMap;
use parking_lot::RwLock;
use regex::Regex;
use tracing::{debug, info, warn};

/// Default capture for a placeholder without a custom pattern.
const DEFAULT_CAPTURE: &str = ".+?";

fn key_placeholder() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\{\{([a-zA-Z0-9_-]+)(?::([^}]+))?\}\}").expect("key placeholder pattern")
    })
}

fn value_placeholder() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{([a-zA-Z0-9_-]+)\}\}").expect("value placeholder pattern"))
}

/// One compiled template.
#[derive(Debug, Clone)]
pub struct GlossaryRule {
    pub key_template: String,
    pub value_template: String,
    pattern: fancy_regex::Regex,
    /// First-occurrence variable names, in capture order.
    pub variables: Vec<String>,
    /// Absolute capture group index of each entry in `variables`.
    group_indices: Vec<usize>,
}

impl GlossaryRule {
    pub fn pattern(&self) -> &str {
        self.pattern.as_str()
    }

    /// Full-string match; returns the substituted value.
    fn apply(&self, text: &str) -> Option<String> {
        let caps = match self.pattern.captures(text) {
            Ok(Some(caps)) => caps,
            Ok(None) => return None,
            Err(e) => {
                warn!(key = %self.key_template, error = %e, "glossary match aborted");
                return None;
            }
        };

        let bindings: HashMap<&str, &str> = self
            .variables
            .iter()
            .zip(&self.group_indices)
            .map(|(name, &idx)| {
                (name.as_str(), caps.get(idx).map(|m| m.as_str()).unwrap_or(""))
            })
            .collect();

        let output = value_placeholder().replace_all(&self.value_template, |c: &regex::Captures| {
            let name = &c[1];
            match bindings.get(name) {
                Some(v) => (*v).to_string(),
                None => {
                    warn!(
                        key = %self.key_template,
                        variable = name,
                        "value placeholder has no captured binding, left as-is"
                    );
                    c[0].to_string()
                }
            }
        });
        debug!(key = %self.key_template, ?bindings, "glossary_rule_matched");
        Some(output.into_owned())
    }
}

#[derive(Debug)]
enum CompileError {
    /// Names used in the value that the key never captures.
    MissingVariables(Vec<String>),
    Regex(fancy_regex::Error),
}

/// Build the anchored pattern for one key template.
fn compile_rule(key: &str, value: &str) -> Result<GlossaryRule, CompileError> {
    let key_names: HashSet<&str> = key_placeholder()
        .captures_iter(key)
        .filter_map(|c| c.get(1).map(|m| m.as_str()))
        .collect();
    let mut missing: Vec<String> = key_placeholder()
        .captures_iter(value)
        .filter_map(|c| c.get(1).map(|m| m.as_str()))
        .filter(|name| !key_names.contains(name))
        .map(str::to_string)
        .collect::<HashSet<_>>()
        .into_iter()
        .collect();
    if !missing.is_empty() {
        missing.sort();
        return Err(CompileError::MissingVariables(missing));
    }

    let mut pattern = String::from("^");
    let mut variables = Vec::new();
    let mut group_indices = Vec::new();
    let mut seen: HashMap<String, usize> = HashMap::new();
    let mut next_group = 1;
    let mut last = 0;

    for caps in key_placeholder().captures_iter(key) {
        let Some(whole) = caps.get(0) else { continue };
        let name = &caps[1];
        pattern.push_str(&fancy_regex::escape(&key[last..whole.start()]));

        match seen.get(name) {
            Some(&idx) => {
                pattern.push_str(&format!("(?:\\{idx})"));
            }
            None => {
                let custom = caps.get(2).map(|m| m.as_str());
                let body = custom.unwrap_or(DEFAULT_CAPTURE);
                // groups inside a custom pattern shift every later index
                let nested = match custom {
                    Some(c) => fancy_regex::Regex::new(c)
                        .map_err(CompileError::Regex)?
                        .captures_len()
                        .saturating_sub(1),
                    None => 0,
                };
                pattern.push('(');
                pattern.push_str(body);
                pattern.push(')');
                seen.insert(name.to_string(), next_group);
                variables.push(name.to_string());
                group_indices.push(next_group);
                next_group += 1 + nested;
            }
        }
        last = whole.end();
    }
    pattern.push_str(&fancy_regex::escape(&key[last..]));
    pattern.push('$');

    let compiled = fancy_regex::Regex::new(&pattern).map_err(CompileError::Regex)?;
    Ok(GlossaryRule {
        key_template: key.to_string(),
        value_template: value.to_string(),
        pattern: compiled,
        variables,
        group_indices,
    })
}

/// Immutable result of compiling one glossary mapping.
#[derive(Debug, Default)]
pub struct CompiledGlossary {
    rules: Vec<GlossaryRule>,
    /// Raw entries eligible for exact lookup (no captured variables, not rejected).
    exact: IndexMap<String, String>,
}

impl CompiledGlossary {
    /// Compile every entry. Broken rules are logged and skipped, never fatal.
    pub fn compile(entries: &IndexMap<String, String>) -> Self {
        let mut rules = Vec::with_capacity(entries.len());
        let mut exact = IndexMap::new();

        for (key, value) in entries {
            match compile_rule(key, value) {
                Ok(rule) => {
                    debug!(
                        key = %key,
                        pattern = rule.pattern(),
                        variables = ?rule.variables,
                        "glossary_rule_compiled"
                    );
                    if rule.variables.is_empty() {
                        exact.insert(key.clone(), value.clone());
                    }
                    rules.push(rule);
                }
                Err(CompileError::MissingVariables(missing)) => {
                    warn!(
                        key = %key,
                        value = %value,
                        missing = ?missing,
                        "glossary rule dropped: value uses variables not present in key"
                    );
                }
                Err(CompileError::Regex(e)) => {
                    warn!(key = %key, error = %e, "glossary rule has invalid pattern, exact match only");
                    exact.insert(key.clone(), value.clone());
                }
            }
        }

        Self { rules, exact }
    }

    pub fn rules(&self) -> &[GlossaryRule] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty() && self.exact.is_empty()
    }

    /// First rule match in insertion order, else exact key lookup.
    pub fn lookup(&self, text: &str) -> Option<String> {
        if let Some(out) = self.rules.iter().find_map(|rule| rule.apply(text)) {
            return Some(out);
        }
        self.exact.get(text).map(|v| {
            debug!(key = %text, "glossary_exact_match");
            v.clone()
        })
    }
}

/// Owned glossary shared by dispatch workers. Recompiles off-lock and swaps atomically.
pub struct GlossaryEngine {
    compiled: RwLock<Arc<CompiledGlossary>>,
}

impl GlossaryEngine {
    pub fn new(entries: &IndexMap<String, String>) -> Self {
        let compiled = CompiledGlossary::compile(entries);
        info!(rules = compiled.len(), "glossary compiled");
        Self {
            compiled: RwLock::new(Arc::new(compiled)),
        }
    }

    pub fn empty() -> Self {
        Self {
            compiled: RwLock::new(Arc::new(CompiledGlossary::default())),
        }
    }

    /// Replace the rule set. Readers see either the old or the new set, never a mix.
    pub fn reload(&self, entries: &IndexMap<String, String>) {
        let compiled = Arc::new(CompiledGlossary::compile(entries));
        let rules = compiled.len();
        *self.compiled.write() = compiled;
        info!(rules, "glossary reloaded");
    }

    pub fn snapshot(&self) -> Arc<CompiledGlossary> {
        self.compiled.read().clone()
    }

    pub fn lookup(&self, text: &str) -> Option<String> {
        self.snapshot().lookup(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn glossary(pairs: &[(&str, &str)]) -> IndexMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn literal_rule() {
        let g = CompiledGlossary::compile(&glossary(&[("gg wp", "well played")]));
        assert_eq!(g.lookup("gg wp").as_deref(), Some("well played"));
        assert_eq!(g.lookup("gg wp!"), None);
        assert_eq!(g.lookup("xgg wp"), None);
    }

    #[test]
    fn literal_metacharacters_are_escaped() {
        let g = CompiledGlossary::compile(&glossary(&[("what? (really) $5.00", "真的?")]));
        assert_eq!(g.lookup("what? (really) $5.00").as_deref(), Some("真的?"));
        assert_eq!(g.lookup("what (really) $5x00"), None);
    }

    #[test]
    fn variables_are_substituted() {
        let g = CompiledGlossary::compile(&glossary(&[(
            "{{player}} joined the game",
            "{{player}} 加入了游戏",
        )]));
        assert_eq!(
            g.lookup("Steve joined the game").as_deref(),
            Some("Steve 加入了游戏")
        );
        assert_eq!(g.lookup("joined the game"), None);
    }

    #[test]
    fn repeated_value_placeholders_all_replaced() {
        let g = CompiledGlossary::compile(&glossary(&[(
            "{{a}} vs {{b}}",
            "{{b}} 对 {{a}} ({{a}})",
        )]));
        assert_eq!(g.lookup("red vs blue").as_deref(), Some("blue 对 red (red)"));
    }

    #[test]
    fn back_reference_requires_identical_spans() {
        let g = CompiledGlossary::compile(&glossary(&[("{{x}} and {{x}}", "两个 {{x}}")]));
        assert_eq!(g.rules()[0].variables, vec!["x"]);
        assert_eq!(g.lookup("cat and cat").as_deref(), Some("两个 cat"));
        assert_eq!(g.lookup("cat and dog"), None);
    }

    #[test]
    fn back_reference_followed_by_digit() {
        let g = CompiledGlossary::compile(&glossary(&[("{{a}}-{{a}}1", "ok {{a}}")]));
        assert_eq!(g.lookup("x-x1").as_deref(), Some("ok x"));
    }

    #[test]
    fn custom_patterns_and_nested_groups() {
        let g = CompiledGlossary::compile(&glossary(&[
            (r"rolled {{n:\d+}}", "掷出 {{n}}"),
            ("{{t:(ab)+}} then {{u}}", "{{u}}/{{t}}"),
        ]));
        assert_eq!(g.lookup("rolled 42").as_deref(), Some("掷出 42"));
        assert_eq!(g.lookup("rolled many"), None);
        assert_eq!(g.lookup("abab then x").as_deref(), Some("x/abab"));
    }

    #[test]
    fn value_with_unknown_variable_is_dropped_everywhere() {
        let g = CompiledGlossary::compile(&glossary(&[
            ("{{a}} hi", "{{b}} 你好"),
            ("bye", "再见"),
        ]));
        assert_eq!(g.len(), 1);
        assert_eq!(g.lookup("x hi"), None);
        assert_eq!(g.lookup("{{a}} hi"), None);
        assert_eq!(g.lookup("bye").as_deref(), Some("再见"));
    }

    #[test]
    fn insertion_order_decides_priority() {
        let g = CompiledGlossary::compile(&glossary(&[
            ("{{x}} wins", "first {{x}}"),
            ("gg wins", "second"),
        ]));
        assert_eq!(g.lookup("gg wins").as_deref(), Some("first gg"));

        let g = CompiledGlossary::compile(&glossary(&[
            ("gg wins", "second"),
            ("{{x}} wins", "first {{x}}"),
        ]));
        assert_eq!(g.lookup("gg wins").as_deref(), Some("second"));
    }

    #[test]
    fn invalid_custom_pattern_keeps_other_rules() {
        let g = CompiledGlossary::compile(&glossary(&[
            ("{{n:[}} broken", "坏 {{n}}"),
            ("fine", "好"),
        ]));
        assert_eq!(g.len(), 1);
        assert_eq!(g.lookup("fine").as_deref(), Some("好"));
        assert_eq!(g.lookup("[ broken"), None);
    }

    #[test]
    fn compile_is_idempotent() {
        let entries = glossary(&[
            ("{{x}} and {{x}}", "{{x}}!"),
            (r"hp {{v:\d+}}/{{m:\d+}}", "{{v}} of {{m}}"),
            ("gg", "good game"),
        ]);
        let a = CompiledGlossary::compile(&entries);
        let b = CompiledGlossary::compile(&entries);
        let patterns = |g: &CompiledGlossary| {
            g.rules().iter().map(|r| r.pattern().to_string()).collect::<Vec<_>>()
        };
        assert_eq!(patterns(&a), patterns(&b));
        for input in ["a and a", "a and b", "hp 3/10", "gg", "nothing"] {
            assert_eq!(a.lookup(input), b.lookup(input), "{input}");
        }
    }

    #[test]
    fn engine_reload_swaps_rules() {
        let engine = GlossaryEngine::new(&glossary(&[("gg", "good game")]));
        let before = engine.snapshot();
        engine.reload(&glossary(&[("gg", "打得好")]));
        assert_eq!(engine.lookup("gg").as_deref(), Some("打得好"));
        // a snapshot taken earlier keeps serving the old rules
        assert_eq!(before.lookup("gg").as_deref(), Some("good game"));
        assert!(GlossaryEngine::empty().lookup("gg").is_none());
    }
}
