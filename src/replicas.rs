//! Replica synchronization
//!
//! One convergence step toward a target replica count: clone the missing
//! instances or destroy the surplus, never both, never retried. Backend
//! failures are absorbed into the returned count so the caller always learns
//! how many instances exist now, even after a half-finished batch.

use std::cmp::Ordering;

use tracing::{debug, info, warn};

use crate::vsphere::{Sizing, VsphereClient};

/// Move `container` from `current` toward `desired` instances
///
/// Returns the instance count after the step:
/// - `current == desired`: no backend call, returns `current`
/// - `current > desired`: returns `current - destroyed`, within `[desired, current]`
/// - `current < desired`: returns `current + created`, within `[current, desired]`
pub async fn sync(
    client: &dyn VsphereClient,
    container: &str,
    template: &str,
    sizing: &Sizing,
    current: u32,
    desired: u32,
) -> u32 {
    match current.cmp(&desired) {
        Ordering::Equal => {
            debug!(group = container, replicas = current, "replica count already in sync");
            current
        }
        Ordering::Greater => {
            let surplus = current - desired;
            info!(group = container, current, desired, "scaling down");
            let destroyed = match client.power_off_and_destroy(container, surplus).await {
                Ok(n) => n,
                Err(e) => {
                    warn!(group = container, error = %e, "scale-down stopped early");
                    e.partial_progress()
                }
            };
            current - destroyed.min(surplus)
        }
        Ordering::Less => {
            let missing = desired - current;
            info!(group = container, current, desired, template, "scaling up");
            let created = match client.clone_vms(template, container, sizing, missing).await {
                Ok(n) => n,
                Err(e) => {
                    warn!(group = container, error = %e, "scale-up stopped early");
                    e.partial_progress()
                }
            };
            current + created.min(missing)
        }
    }
}
