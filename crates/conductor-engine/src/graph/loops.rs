use std::collections::{BTreeMap, HashMap, HashSet};
use std::str::FromStr;

use conductor_core::template::Template;

/// Name segments that mark a step as a reworked iteration of another.
const REFINEMENT_MARKERS: &[&str] = &["refactored", "refined", "revised", "improved", "updated"];

/// Which member of a loop pattern an alias selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AliasKind {
    /// Most recently executed member (base if none ran yet).
    Latest,
    /// The base step.
    First,
    /// Second-to-last executed member (or the only one, or the base).
    Previous,
}

impl FromStr for AliasKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "latest" => Ok(AliasKind::Latest),
            "first" => Ok(AliasKind::First),
            "previous" => Ok(AliasKind::Previous),
            _ => Err(()),
        }
    }
}

/// Families of steps that are repeated iterations of one conceptual step.
///
/// Built once per compiled template. Used only to resolve `{@latest:..}`,
/// `{@first:..}` and `{@previous:..}` aliases; it has no say in scheduling.
#[derive(Debug, Clone, Default)]
pub struct LoopPatterns {
    /// Pattern key -> members in declaration order, base first.
    families: BTreeMap<String, Vec<String>>,
    /// Step id -> pattern key.
    member_of: HashMap<String, String>,
    step_ids: HashSet<String>,
}

impl LoopPatterns {
    /// Group the template's steps into loop families.
    ///
    /// Steps with an explicit `loop_family` are grouped by that label (a step
    /// whose id equals the label joins as base). The remaining steps are
    /// grouped by name: `x` and `x_<suffix>` belong together, as do
    /// multi-part names that differ only by a refinement marker
    /// (`review_code` / `review_refactored_code`).
    pub fn detect(template: &Template) -> Self {
        let mut patterns = LoopPatterns {
            step_ids: template.steps.iter().map(|s| s.id.clone()).collect(),
            ..Default::default()
        };

        let mut explicit: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for step in &template.steps {
            if let Some(family) = &step.loop_family {
                let members = explicit.entry(family.clone()).or_default();
                if !members.contains(&step.id) {
                    members.push(step.id.clone());
                }
            }
        }
        for (family, members) in explicit.iter_mut() {
            let base_is_free = template
                .step(family)
                .is_some_and(|s| s.loop_family.is_none());
            if base_is_free && !members.contains(family) {
                members.insert(0, family.clone());
            }
        }
        let claimed: HashSet<String> = explicit.values().flatten().cloned().collect();

        let candidates: Vec<&str> = template
            .steps
            .iter()
            .map(|s| s.id.as_str())
            .filter(|id| !claimed.contains(*id))
            .collect();
        let mut groups = UnionFind::new(candidates.len());
        for (i, a) in candidates.iter().enumerate() {
            for (j, b) in candidates.iter().enumerate().skip(i + 1) {
                if same_family(a, b) {
                    groups.union(i, j);
                }
            }
        }

        let mut heuristic: BTreeMap<usize, Vec<&str>> = BTreeMap::new();
        for (i, id) in candidates.iter().enumerate() {
            let root = groups.find(i);
            let members = heuristic.entry(root).or_default();
            if !members.contains(id) {
                members.push(id);
            }
        }
        for members in heuristic.into_values().filter(|m| m.len() > 1) {
            // Base: the shortest name, earliest declared on ties.
            let base = members
                .iter()
                .enumerate()
                .min_by_key(|(pos, id)| (id.len(), *pos))
                .map(|(_, id)| id.to_string())
                .unwrap_or_default();
            let mut ordered = vec![base.clone()];
            ordered.extend(
                members
                    .iter()
                    .filter(|id| **id != base)
                    .map(|id| id.to_string()),
            );
            patterns.insert(base, ordered);
        }

        for (family, members) in explicit {
            patterns.insert(family, members);
        }
        patterns
    }

    fn insert(&mut self, key: String, members: Vec<String>) {
        for member in &members {
            self.member_of.insert(member.clone(), key.clone());
        }
        self.families.insert(key, members);
    }

    /// Pattern key a step belongs to, if any.
    pub fn pattern_of(&self, step_id: &str) -> Option<&str> {
        self.member_of.get(step_id).map(String::as_str)
    }

    /// Resolve a name used in an alias to a pattern key. Accepts the key
    /// itself or any member id.
    pub fn resolve_key<'a>(&'a self, name: &'a str) -> Option<&'a str> {
        if let Some((key, _)) = self.families.get_key_value(name) {
            return Some(key.as_str());
        }
        self.pattern_of(name)
    }

    /// Members of a pattern, base first.
    pub fn members(&self, pattern: &str) -> Option<&[String]> {
        self.families.get(pattern).map(Vec::as_slice)
    }

    pub fn base(&self, pattern: &str) -> Option<&str> {
        self.members(pattern)
            .and_then(|m| m.first())
            .map(String::as_str)
    }

    /// Every detected pattern with its members.
    pub fn families(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.families
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    pub fn is_empty(&self) -> bool {
        self.families.is_empty()
    }

    /// Resolve an alias to a step id.
    ///
    /// `executed` is the order in which the pattern's members have run so
    /// far. A name that is a plain step id outside every pattern resolves to
    /// itself. Returns `None` for names that are neither.
    pub fn resolve_alias(
        &self,
        kind: AliasKind,
        name: &str,
        executed: &[String],
    ) -> Option<String> {
        let base = match self.resolve_key(name) {
            Some(key) => self.base(key)?.to_string(),
            None if self.step_ids.contains(name) => return Some(name.to_string()),
            None => return None,
        };

        let resolved = match kind {
            AliasKind::First => base,
            AliasKind::Latest => executed.last().cloned().unwrap_or(base),
            AliasKind::Previous => match executed.len() {
                0 => base,
                1 => executed[0].clone(),
                n => executed[n - 2].clone(),
            },
        };
        Some(resolved)
    }
}

fn same_family(a: &str, b: &str) -> bool {
    let (short, long) = if a.len() <= b.len() { (a, b) } else { (b, a) };
    if long
        .strip_prefix(short)
        .is_some_and(|rest| rest.starts_with('_'))
    {
        return true;
    }
    is_refined_variant(short, long)
}

/// `long` is `short` with refinement markers spliced into its segments.
fn is_refined_variant(short: &str, long: &str) -> bool {
    let short_parts: Vec<&str> = short.split('_').collect();
    let long_parts: Vec<&str> = long.split('_').collect();
    if short_parts.len() < 2 || long_parts.len() <= short_parts.len() {
        return false;
    }
    if short_parts[0] != long_parts[0] {
        return false;
    }
    let has_marker = long_parts.iter().any(|p| REFINEMENT_MARKERS.contains(p));
    let stripped: Vec<&str> = long_parts
        .into_iter()
        .filter(|p| !REFINEMENT_MARKERS.contains(p))
        .collect();
    has_marker && stripped == short_parts
}

struct UnionFind {
    parent: Vec<usize>,
}

impl UnionFind {
    fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
        }
    }

    fn find(&mut self, i: usize) -> usize {
        let mut root = i;
        while self.parent[root] != root {
            root = self.parent[root];
        }
        let mut cur = i;
        while self.parent[cur] != root {
            let next = self.parent[cur];
            self.parent[cur] = root;
            cur = next;
        }
        root
    }

    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra != rb {
            // Keep the earlier-declared root so iteration order stays stable.
            let (keep, merge) = if ra < rb { (ra, rb) } else { (rb, ra) };
            self.parent[merge] = keep;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conductor_core::template::Step;

    fn template(ids: &[&str]) -> Template {
        ids.iter().fold(Template::new("t"), |t, id| {
            t.with_step(Step::agent(*id, "x"))
        })
    }

    #[test]
    fn test_prefix_underscore_family() {
        let patterns = LoopPatterns::detect(&template(&["draft", "review", "draft_revised"]));
        assert_eq!(
            patterns.members("draft").unwrap(),
            &["draft".to_string(), "draft_revised".to_string()]
        );
        assert_eq!(patterns.pattern_of("draft_revised"), Some("draft"));
        assert_eq!(patterns.pattern_of("review"), None);
    }

    #[test]
    fn test_prefix_without_underscore_is_unrelated() {
        let patterns = LoopPatterns::detect(&template(&["draft", "drafting"]));
        assert!(patterns.is_empty());
    }

    #[test]
    fn test_refined_variant_family() {
        let patterns =
            LoopPatterns::detect(&template(&["review_code", "refactor", "review_refactored_code"]));
        assert_eq!(
            patterns.members("review_code").unwrap(),
            &[
                "review_code".to_string(),
                "review_refactored_code".to_string()
            ]
        );
    }

    #[test]
    fn test_marker_without_shared_prefix_is_unrelated() {
        let patterns = LoopPatterns::detect(&template(&["review_code", "audit_refined_code"]));
        assert!(patterns.is_empty());
    }

    #[test]
    fn test_transitive_grouping_picks_shortest_base() {
        let patterns =
            LoopPatterns::detect(&template(&["draft_revised", "draft", "draft_revised_2"]));
        assert_eq!(patterns.base("draft"), Some("draft"));
        assert_eq!(patterns.members("draft").unwrap().len(), 3);
        assert_eq!(patterns.resolve_key("draft_revised_2"), Some("draft"));
    }

    #[test]
    fn test_explicit_family_adopts_base_step() {
        let t = Template::new("t")
            .with_step(Step::agent("fetch", "x"))
            .with_step(Step::agent("retry_fetch", "x").in_loop_family("fetch"))
            .with_step(Step::agent("fetch_notes", "x"));
        let patterns = LoopPatterns::detect(&t);
        assert_eq!(
            patterns.members("fetch").unwrap(),
            &["fetch".to_string(), "retry_fetch".to_string()]
        );
        // fetch is claimed by the explicit family, so the heuristic leaves
        // fetch_notes alone.
        assert_eq!(patterns.pattern_of("fetch_notes"), None);
    }

    #[test]
    fn test_explicit_family_without_matching_step() {
        let t = Template::new("t")
            .with_step(Step::agent("write", "x").in_loop_family("essay"))
            .with_step(Step::agent("polish", "x").in_loop_family("essay"));
        let patterns = LoopPatterns::detect(&t);
        assert_eq!(patterns.base("essay"), Some("write"));
        assert_eq!(patterns.resolve_key("polish"), Some("essay"));
    }

    #[test]
    fn test_alias_resolution_follows_execution_order() {
        let patterns = LoopPatterns::detect(&template(&["draft", "draft_revised"]));

        let none: Vec<String> = vec![];
        let one = vec!["draft".to_string()];
        let two = vec!["draft".to_string(), "draft_revised".to_string()];

        assert_eq!(patterns.resolve_alias(AliasKind::Latest, "draft", &none).as_deref(), Some("draft"));
        assert_eq!(patterns.resolve_alias(AliasKind::Latest, "draft", &one).as_deref(), Some("draft"));
        assert_eq!(
            patterns.resolve_alias(AliasKind::Latest, "draft", &two).as_deref(),
            Some("draft_revised")
        );
        assert_eq!(patterns.resolve_alias(AliasKind::Previous, "draft", &two).as_deref(), Some("draft"));
        assert_eq!(patterns.resolve_alias(AliasKind::Previous, "draft", &one).as_deref(), Some("draft"));
        assert_eq!(patterns.resolve_alias(AliasKind::Previous, "draft", &none).as_deref(), Some("draft"));
        assert_eq!(patterns.resolve_alias(AliasKind::First, "draft", &two).as_deref(), Some("draft"));
    }

    #[test]
    fn test_alias_on_plain_step_and_unknown_name() {
        let patterns = LoopPatterns::detect(&template(&["solo"]));
        assert_eq!(
            patterns.resolve_alias(AliasKind::Latest, "solo", &[]).as_deref(),
            Some("solo")
        );
        assert_eq!(patterns.resolve_alias(AliasKind::Latest, "ghost", &[]), None);
    }

    #[test]
    fn test_alias_kind_parsing() {
        assert_eq!("latest".parse::<AliasKind>(), Ok(AliasKind::Latest));
        assert_eq!("first".parse::<AliasKind>(), Ok(AliasKind::First));
        assert_eq!("previous".parse::<AliasKind>(), Ok(AliasKind::Previous));
        assert!("last".parse::<AliasKind>().is_err());
    }
}
