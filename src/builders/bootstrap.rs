//! Startup sequence: quota discovery, baseline adjustment and queue seeding.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::HarvestConfig;
use crate::core::{
    AdmissionScheduler, CapacityCatalog, CostSource, FamilyId, FamilyRules, HarvestError,
    PendingItem, QuotaDiscovery, QuotaTable, WorkItem,
};

/// A scheduler ready to admit, plus the catalog it was seeded from.
pub struct Bootstrap {
    /// Scheduler holding the seeded queue and quota table.
    pub scheduler: AdmissionScheduler,
    /// Catalog with every cost resolved during startup already cached.
    pub catalog: CapacityCatalog,
}

/// Discover quota families and their limits.
///
/// # Errors
///
/// [`HarvestError::QuotaDiscovery`] if listing limits fails and
/// [`HarvestError::NoQuotaFamilies`] if no quota carries the configured
/// marker. Both are fatal: admitting without a baseline could exceed the
/// provider's limits.
pub async fn discover_quotas(
    config: &HarvestConfig,
    discovery: &dyn QuotaDiscovery,
) -> Result<(FamilyRules, QuotaTable), HarvestError> {
    let limits = discovery
        .list_limits()
        .await
        .map_err(HarvestError::QuotaDiscovery)?;
    let (rules, family_limits) =
        FamilyRules::from_provider_quotas(&limits, &config.quota_name_marker)?;
    if rules.is_empty() {
        return Err(HarvestError::NoQuotaFamilies);
    }
    info!(families = rules.len(), quotas = limits.len(), "loaded quota families");
    Ok((rules, QuotaTable::from_limits(family_limits)))
}

/// Subtract capacity held by instances this process did not launch.
///
/// Consumer types without a family or cost are skipped. Returns the units
/// subtracted per family.
///
/// # Errors
///
/// Propagates failures listing consumers or describing their costs.
pub async fn subtract_active_consumers(
    catalog: &CapacityCatalog,
    quotas: &mut QuotaTable,
    discovery: &dyn QuotaDiscovery,
) -> Result<BTreeMap<FamilyId, u32>, HarvestError> {
    let consumers = discovery.list_active_consumers().await?;
    if consumers.is_empty() {
        debug!("no externally owned instances running");
        return Ok(BTreeMap::new());
    }

    let types: Vec<String> = consumers.iter().map(|c| c.instance_type.clone()).collect();
    let costs = catalog.lookup_costs(&types).await?;

    let mut consumed: BTreeMap<FamilyId, u32> = BTreeMap::new();
    for consumer in &consumers {
        let Some(family) = catalog.family(&consumer.instance_type) else {
            debug!(instance_type = %consumer.instance_type, "running instance matches no quota family");
            continue;
        };
        let Some(&cost) = costs.get(&consumer.instance_type) else {
            warn!(instance_type = %consumer.instance_type, "no cost for running instance, not subtracted");
            continue;
        };
        let units = cost.saturating_mul(consumer.count);
        let total = consumed.entry(family).or_default();
        *total = total.saturating_add(units);
    }

    for (family, units) in &consumed {
        quotas.subtract_external(family, *units);
    }
    Ok(consumed)
}

/// Resolve family and cost for every item with one batched cost lookup.
///
/// A failed lookup leaves every cost unresolved; such items are dropped by
/// the scheduler's first scan.
pub async fn resolve_items(catalog: &CapacityCatalog, items: Vec<WorkItem>) -> Vec<PendingItem> {
    let types: Vec<String> = items.iter().map(|i| i.instance_type().to_owned()).collect();
    let costs: HashMap<String, u32> = match catalog.lookup_costs(&types).await {
        Ok(costs) => costs,
        Err(e) => {
            warn!(error = %e, "cost lookup failed; queued items are unschedulable");
            HashMap::new()
        }
    };

    items
        .into_iter()
        .map(|item| {
            let family = catalog.family(item.instance_type());
            let cost = costs.get(item.instance_type()).copied();
            PendingItem::new(item, family, cost)
        })
        .collect()
}

/// Run the full startup sequence and return a scheduler ready to admit.
///
/// A failure listing active consumers is logged and the nominal limits are
/// used.
///
/// # Errors
///
/// See [`discover_quotas`].
pub async fn build_scheduler(
    config: &HarvestConfig,
    discovery: &dyn QuotaDiscovery,
    costs: Arc<dyn CostSource>,
    items: Vec<WorkItem>,
) -> Result<Bootstrap, HarvestError> {
    let (rules, mut quotas) = discover_quotas(config, discovery).await?;
    let catalog = CapacityCatalog::new(rules, costs);

    if let Err(e) = subtract_active_consumers(&catalog, &mut quotas, discovery).await {
        warn!(error = %e, "failed to load running instances; using nominal quota limits");
    }

    let pending = resolve_items(&catalog, items).await;
    let scheduler = AdmissionScheduler::new(quotas, pending);
    Ok(Bootstrap { scheduler, catalog })
}
