//! Capacity catalog: quota-family classification and the cost cache.
//!
//! Family classification is a pure lookup over a precompiled rule table.
//! Costs come from a [`CostSource`] and are cached for the lifetime of the
//! catalog; a miss is resolved with one batched call for every unknown type
//! requested together.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::core::{CostSource, HarvestError, ProviderQuota};

/// Words in a quota name that never name an instance family.
const NON_FAMILY_WORDS: &[&str] = &[
    "All",
    "Spot",
    "On",
    "Demand",
    "Instance",
    "Instances",
    "Requests",
    "Standard",
    "and",
    "Running",
];

/// Identifier of a quota family: its prefix tokens joined with commas.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FamilyId(String);

impl FamilyId {
    /// Wrap a family identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the identifier text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FamilyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One family: the instance-type prefixes that share a quota.
#[derive(Debug, Clone)]
pub struct FamilyRule {
    id: FamilyId,
    tokens: Vec<String>,
    pattern: Regex,
}

impl FamilyRule {
    /// Compile a rule from family prefix tokens (`["g", "vt"]`).
    ///
    /// The rule matches `^(tok|...)\d*\w*\.`; longer tokens are tried first so
    /// the captured prefix is the most specific one.
    ///
    /// # Errors
    ///
    /// Returns [`HarvestError::EmptyFamilyRule`] if no token is left after
    /// trimming, and [`HarvestError::InvalidFamilyPattern`] if the pattern
    /// fails to compile.
    pub fn new<I, S>(tokens: I) -> Result<Self, HarvestError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let tokens: Vec<String> = tokens
            .into_iter()
            .map(|t| t.as_ref().trim().to_lowercase())
            .filter(|t| !t.is_empty())
            .collect();
        // An empty alternation would match every dotted type name.
        if tokens.is_empty() {
            return Err(HarvestError::EmptyFamilyRule);
        }

        let mut alternation: Vec<&str> = tokens.iter().map(String::as_str).collect();
        alternation.sort_by(|a, b| b.len().cmp(&a.len()));
        let escaped: Vec<String> = alternation.iter().map(|t| regex::escape(t)).collect();
        let pattern = Regex::new(&format!(r"^({})\d*\w*\.", escaped.join("|")))?;

        Ok(Self {
            id: FamilyId::new(tokens.join(",")),
            tokens,
            pattern,
        })
    }

    /// Family identifier.
    #[must_use]
    pub const fn id(&self) -> &FamilyId {
        &self.id
    }

    /// Prefix tokens in declaration order.
    #[must_use]
    pub fn tokens(&self) -> &[String] {
        &self.tokens
    }

    /// Compiled pattern source.
    #[must_use]
    pub fn pattern(&self) -> &str {
        self.pattern.as_str()
    }

    /// Length of the matching prefix token, if `instance_type` belongs here.
    fn matched_len(&self, instance_type: &str) -> Option<usize> {
        self.pattern
            .captures(instance_type)
            .and_then(|c| c.get(1))
            .map(|m| m.len())
    }
}

/// Extract family tokens from a provider quota name.
///
/// Returns `None` when the name does not contain `marker` or carries no
/// family words.
#[must_use]
pub fn family_tokens(quota_name: &str, marker: &str) -> Option<Vec<String>> {
    if !quota_name.contains(marker) {
        return None;
    }
    let tokens: Vec<String> = quota_name
        .split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|w| !w.is_empty() && !NON_FAMILY_WORDS.contains(w))
        .map(str::to_lowercase)
        .collect();
    (!tokens.is_empty()).then_some(tokens)
}

/// Ordered rule table mapping instance types to quota families.
#[derive(Debug, Clone, Default)]
pub struct FamilyRules {
    rules: Vec<FamilyRule>,
}

impl FamilyRules {
    /// Build a table from already compiled rules. Order breaks ties.
    #[must_use]
    pub const fn new(rules: Vec<FamilyRule>) -> Self {
        Self { rules }
    }

    /// The provider's published spot families.
    ///
    /// # Errors
    ///
    /// Propagates pattern compilation failures.
    pub fn standard_spot() -> Result<Self, HarvestError> {
        let families: &[&[&str]] = &[
            &["a", "c", "d", "h", "i", "m", "r", "t", "z"],
            &["dl"],
            &["f"],
            &["g", "vt"],
            &["inf"],
            &["p2", "p3", "p4"],
            &["p5"],
            &["trn"],
            &["x"],
        ];
        let rules = families
            .iter()
            .map(|tokens| FamilyRule::new(tokens.iter()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(rules))
    }

    /// Parse provider quotas into a rule table plus each family's limit.
    ///
    /// Quotas whose name lacks `marker` are ignored; a family reported twice
    /// keeps its first limit.
    ///
    /// # Errors
    ///
    /// Propagates pattern compilation failures.
    pub fn from_provider_quotas(
        quotas: &[ProviderQuota],
        marker: &str,
    ) -> Result<(Self, Vec<(FamilyId, u32)>), HarvestError> {
        let mut rules: Vec<FamilyRule> = Vec::new();
        let mut limits = Vec::new();

        for quota in quotas {
            let Some(tokens) = family_tokens(&quota.name, marker) else {
                continue;
            };
            let rule = FamilyRule::new(&tokens)?;
            if rules.iter().any(|r| r.id() == rule.id()) {
                warn!(family = %rule.id(), quota = %quota.name, "duplicate quota family ignored");
                continue;
            }
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let limit = quota.value.max(0.0).floor() as u32;
            info!(family = %rule.id(), limit, pattern = rule.pattern(), "discovered quota family");
            limits.push((rule.id().clone(), limit));
            rules.push(rule);
        }

        Ok((Self::new(rules), limits))
    }

    /// Resolve the family of `instance_type`.
    ///
    /// When several rules match, the one whose matching token is longest wins
    /// (`inf` over `i` for `inf2.xlarge`); equal lengths resolve to table order.
    #[must_use]
    pub fn classify(&self, instance_type: &str) -> Option<&FamilyId> {
        let mut best: Option<(usize, &FamilyRule)> = None;
        for rule in &self.rules {
            if let Some(len) = rule.matched_len(instance_type) {
                if best.is_none_or(|(best_len, _)| len > best_len) {
                    best = Some((len, rule));
                }
            }
        }
        best.map(|(_, rule)| rule.id())
    }

    /// Iterate family identifiers in table order.
    pub fn ids(&self) -> impl Iterator<Item = &FamilyId> {
        self.rules.iter().map(FamilyRule::id)
    }

    /// Number of families.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// True when no family is known.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Family classification plus a shared, batched cost cache.
pub struct CapacityCatalog {
    rules: FamilyRules,
    source: Arc<dyn CostSource>,
    cache: Mutex<HashMap<String, u32>>,
}

impl CapacityCatalog {
    /// Create a catalog over `rules`, resolving costs through `source`.
    pub fn new(rules: FamilyRules, source: Arc<dyn CostSource>) -> Self {
        Self {
            rules,
            source,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Rule table used for classification.
    #[must_use]
    pub const fn rules(&self) -> &FamilyRules {
        &self.rules
    }

    /// Quota family of `instance_type`, if any rule matches.
    #[must_use]
    pub fn family(&self, instance_type: &str) -> Option<FamilyId> {
        self.rules.classify(instance_type).cloned()
    }

    /// Cached cost, without touching the provider.
    #[must_use]
    pub fn cached_cost(&self, instance_type: &str) -> Option<u32> {
        self.cache.lock().get(instance_type).copied()
    }

    /// Number of cached cost entries.
    #[must_use]
    pub fn cached_len(&self) -> usize {
        self.cache.lock().len()
    }

    /// Resolve costs for `instance_types`.
    ///
    /// Cached entries are served directly; all misses go out in a single
    /// [`CostSource::describe_costs`] call. Types the provider does not know
    /// are absent from the returned map.
    ///
    /// # Errors
    ///
    /// Returns [`HarvestError::Provider`] if the batched lookup fails.
    pub async fn lookup_costs(
        &self,
        instance_types: &[String],
    ) -> Result<HashMap<String, u32>, HarvestError> {
        let mut resolved = HashMap::new();
        let mut misses = Vec::new();
        {
            let cache = self.cache.lock();
            let mut seen = HashSet::new();
            for instance_type in instance_types {
                if !seen.insert(instance_type.as_str()) {
                    continue;
                }
                match cache.get(instance_type) {
                    Some(&cost) => {
                        resolved.insert(instance_type.clone(), cost);
                    }
                    None => misses.push(instance_type.clone()),
                }
            }
        }

        if misses.is_empty() {
            return Ok(resolved);
        }

        debug!(count = misses.len(), "describing uncached instance types");
        let fetched = self.source.describe_costs(&misses).await?;

        let mut cache = self.cache.lock();
        for instance_type in misses {
            if let Some(&cost) = fetched.get(&instance_type) {
                let cost = *cache.entry(instance_type.clone()).or_insert(cost);
                resolved.insert(instance_type, cost);
            } else {
                warn!(instance_type = %instance_type, "provider returned no cost information");
            }
        }
        Ok(resolved)
    }

    /// Cost of a single type.
    ///
    /// # Errors
    ///
    /// [`HarvestError::CostUnavailable`] if the provider has no cost for the
    /// type, or [`HarvestError::Provider`] if the lookup fails.
    pub async fn cost(&self, instance_type: &str) -> Result<u32, HarvestError> {
        if let Some(cost) = self.cached_cost(instance_type) {
            return Ok(cost);
        }
        let costs = self.lookup_costs(&[instance_type.to_owned()]).await?;
        costs
            .get(instance_type)
            .copied()
            .ok_or_else(|| HarvestError::CostUnavailable(instance_type.to_owned()))
    }
}
