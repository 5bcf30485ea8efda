//! Batch dependency resolution.
//!
//! Builds a consumer -> provider graph from the declared and consumed
//! capability keys of one installation batch (plus the already
//! installed providers), computes a deterministic install order, and
//! validates layering. Resolution is total-or-nothing: any hard failure
//! here aborts the batch before any attach hook runs.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

use crate::api::{AnyApiKey, Dependency};
use crate::errors::DependencyError;

/// Resolver view of one batched module.
pub(crate) struct BatchModule {
    pub name: String,
    pub layer: Option<String>,
    pub requires: Vec<Dependency>,
    pub provides: Vec<AnyApiKey>,
}

/// Resolver view of one already-registered API.
pub(crate) struct InstalledProvider {
    pub module: String,
    /// Effective layer of the API (key layer, falling back to the
    /// provider module's layer).
    pub layer: Option<String>,
}

/// Result of a successful resolution: batch indices in install order.
/// `skipped` is only populated when cycle checking is disabled; those
/// indices could not be ordered and must not attach.
#[derive(Debug)]
pub(crate) struct InstallPlan {
    pub order: Vec<usize>,
    pub skipped: Vec<usize>,
}

pub(crate) fn resolve_order(
    batch: &[BatchModule],
    installed: &HashMap<String, InstalledProvider>,
    layers: Option<&HashMap<String, i32>>,
    detect_cycles: bool,
) -> Result<InstallPlan, DependencyError> {
    // Key name -> (provider index, declared key layer).
    let mut batch_providers: HashMap<&str, (usize, Option<&'static str>)> = HashMap::new();
    for (idx, module) in batch.iter().enumerate() {
        for key in &module.provides {
            // First declaring module wins; a true duplicate surfaces as
            // a configuration error when the second module attaches.
            batch_providers.entry(key.name).or_insert((idx, key.layer));
        }
    }

    let mut blocked_by: Vec<Vec<usize>> = vec![Vec::new(); batch.len()];
    let mut indegree: Vec<usize> = vec![0; batch.len()];

    for (idx, module) in batch.iter().enumerate() {
        for dep in &module.requires {
            if let Some(&(provider_idx, key_layer)) = batch_providers.get(dep.key.name) {
                let provider = &batch[provider_idx];
                let provider_layer = key_layer
                    .map(str::to_owned)
                    .or_else(|| provider.layer.clone());
                validate_layer(
                    layers,
                    module,
                    &provider.name,
                    provider_layer.as_deref(),
                    dep.key.name,
                )?;
                if provider_idx != idx {
                    blocked_by[idx].push(provider_idx);
                    indegree[idx] += 1;
                }
            } else if let Some(provider) = installed.get(dep.key.name) {
                validate_layer(
                    layers,
                    module,
                    &provider.module,
                    provider.layer.as_deref(),
                    dep.key.name,
                )?;
            } else if !dep.optional {
                return Err(DependencyError::Missing {
                    module: module.name.clone(),
                    key: dep.key.name.to_owned(),
                });
            }
        }
    }

    // Kahn's algorithm; the ready set pops the smallest original batch
    // index so ties keep the caller's order.
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); batch.len()];
    for (consumer, providers) in blocked_by.iter().enumerate() {
        for &provider in providers {
            dependents[provider].push(consumer);
        }
    }

    let mut ready: BinaryHeap<Reverse<usize>> = indegree
        .iter()
        .enumerate()
        .filter(|(_, d)| **d == 0)
        .map(|(i, _)| Reverse(i))
        .collect();

    let mut order = Vec::with_capacity(batch.len());
    while let Some(Reverse(idx)) = ready.pop() {
        order.push(idx);
        for &consumer in &dependents[idx] {
            indegree[consumer] -= 1;
            if indegree[consumer] == 0 {
                ready.push(Reverse(consumer));
            }
        }
    }

    if order.len() == batch.len() {
        return Ok(InstallPlan {
            order,
            skipped: Vec::new(),
        });
    }

    let remaining: Vec<usize> = (0..batch.len())
        .filter(|i| indegree[*i] > 0)
        .collect();

    if !detect_cycles {
        return Ok(InstallPlan {
            order,
            skipped: remaining,
        });
    }

    Err(DependencyError::Circular {
        cycle: enumerate_cycle(batch, &blocked_by, &remaining, &indegree),
    })
}

/// Walks blocked-by edges among the unordered nodes until one repeats,
/// yielding the full cycle (closed by repeating the entry node).
fn enumerate_cycle(
    batch: &[BatchModule],
    blocked_by: &[Vec<usize>],
    remaining: &[usize],
    indegree: &[usize],
) -> Vec<String> {
    let Some(&start) = remaining.first() else {
        return Vec::new();
    };
    let is_remaining = |i: usize| indegree[i] > 0;

    let mut path: Vec<usize> = vec![start];
    let mut current = start;
    loop {
        let Some(&next) = blocked_by[current]
            .iter()
            .find(|&&provider| is_remaining(provider))
        else {
            break;
        };
        if let Some(pos) = path.iter().position(|&p| p == next) {
            let mut cycle: Vec<String> =
                path[pos..].iter().map(|&i| batch[i].name.clone()).collect();
            cycle.push(batch[next].name.clone());
            return cycle;
        }
        path.push(next);
        current = next;
    }
    path.iter().map(|&i| batch[i].name.clone()).collect()
}

fn validate_layer(
    layers: Option<&HashMap<String, i32>>,
    consumer: &BatchModule,
    provider_name: &str,
    provider_layer: Option<&str>,
    key: &str,
) -> Result<(), DependencyError> {
    let Some(index) = layers else {
        return Ok(());
    };
    let (Some(consumer_layer), Some(provider_layer)) = (consumer.layer.as_deref(), provider_layer)
    else {
        return Ok(());
    };
    let consumer_level = *index
        .get(consumer_layer)
        .ok_or_else(|| DependencyError::UnknownLayer {
            module: consumer.name.clone(),
            layer: consumer_layer.to_owned(),
        })?;
    let provider_level = *index
        .get(provider_layer)
        .ok_or_else(|| DependencyError::UnknownLayer {
            module: provider_name.to_owned(),
            layer: provider_layer.to_owned(),
        })?;
    if provider_level > consumer_level {
        return Err(DependencyError::LayerViolation {
            consumer: consumer.name.clone(),
            consumer_layer: consumer_layer.to_owned(),
            provider: provider_name.to_owned(),
            provider_layer: provider_layer.to_owned(),
            key: key.to_owned(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::ApiKey;

    const X: ApiKey<dyn Send> = ApiKey::new("tests.x");
    const Y: ApiKey<dyn Send> = ApiKey::new("tests.y");

    fn module(name: &str, provides: &[AnyApiKey], requires: &[Dependency]) -> BatchModule {
        BatchModule {
            name: name.to_owned(),
            layer: None,
            requires: requires.to_vec(),
            provides: provides.to_vec(),
        }
    }

    fn names(batch: &[BatchModule], order: &[usize]) -> Vec<String> {
        order.iter().map(|&i| batch[i].name.clone()).collect()
    }

    #[test]
    fn provider_precedes_consumer_regardless_of_batch_order() {
        for batch in [
            vec![
                module("b", &[], &[X.required()]),
                module("a", &[X.erased()], &[]),
            ],
            vec![
                module("a", &[X.erased()], &[]),
                module("b", &[], &[X.required()]),
            ],
        ] {
            let plan = resolve_order(&batch, &HashMap::new(), None, true).unwrap();
            assert_eq!(names(&batch, &plan.order), vec!["a", "b"]);
        }
    }

    #[test]
    fn independent_modules_keep_batch_order() {
        let batch = vec![
            module("third", &[], &[]),
            module("first", &[], &[]),
            module("second", &[], &[]),
        ];
        let plan = resolve_order(&batch, &HashMap::new(), None, true).unwrap();
        assert_eq!(plan.order, vec![0, 1, 2]);
    }

    #[test]
    fn missing_required_dependency_fails_and_names_both_sides() {
        let batch = vec![module("consumer", &[], &[X.required()])];
        let err = resolve_order(&batch, &HashMap::new(), None, true).unwrap_err();
        assert!(matches!(
            err,
            DependencyError::Missing { ref module, ref key }
                if module == "consumer" && key == "tests.x"
        ));
    }

    #[test]
    fn optional_dependency_resolves_to_nothing_silently() {
        let batch = vec![module("consumer", &[], &[X.optional()])];
        let plan = resolve_order(&batch, &HashMap::new(), None, true).unwrap();
        assert_eq!(plan.order, vec![0]);
    }

    #[test]
    fn installed_provider_satisfies_without_an_edge() {
        let batch = vec![module("consumer", &[], &[X.required()])];
        let mut installed = HashMap::new();
        installed.insert(
            "tests.x".to_owned(),
            InstalledProvider {
                module: "earlier".to_owned(),
                layer: None,
            },
        );
        let plan = resolve_order(&batch, &installed, None, true).unwrap();
        assert_eq!(plan.order, vec![0]);
    }

    #[test]
    fn mutual_dependency_reports_the_full_cycle() {
        let batch = vec![
            module("a", &[X.erased()], &[Y.required()]),
            module("b", &[Y.erased()], &[X.required()]),
        ];
        let err = resolve_order(&batch, &HashMap::new(), None, true).unwrap_err();
        let DependencyError::Circular { cycle } = err else {
            panic!("expected a circular dependency, got: {err}");
        };
        assert!(cycle.contains(&"a".to_owned()), "cycle: {cycle:?}");
        assert!(cycle.contains(&"b".to_owned()), "cycle: {cycle:?}");
        assert_eq!(cycle.first(), cycle.last(), "cycle closes on itself: {cycle:?}");
    }

    #[test]
    fn disabled_cycle_check_skips_the_participants() {
        let batch = vec![
            module("a", &[X.erased()], &[Y.required()]),
            module("b", &[Y.erased()], &[X.required()]),
            module("free", &[], &[]),
        ];
        let plan = resolve_order(&batch, &HashMap::new(), None, false).unwrap();
        assert_eq!(names(&batch, &plan.order), vec!["free"]);
        assert_eq!(plan.skipped, vec![0, 1]);
    }

    fn layer_index() -> HashMap<String, i32> {
        HashMap::from([("infra".to_owned(), 0), ("product".to_owned(), 1)])
    }

    #[test]
    fn consumer_may_depend_on_lower_or_equal_layer() {
        let mut provider = module("base", &[X.erased()], &[]);
        provider.layer = Some("infra".to_owned());
        let mut consumer = module("app", &[], &[X.required()]);
        consumer.layer = Some("product".to_owned());
        let batch = vec![provider, consumer];
        let plan = resolve_order(&batch, &HashMap::new(), Some(&layer_index()), true).unwrap();
        assert_eq!(names(&batch, &plan.order), vec!["base", "app"]);
    }

    #[test]
    fn consumer_below_its_provider_is_a_layer_violation() {
        let mut provider = module("app", &[X.erased()], &[]);
        provider.layer = Some("product".to_owned());
        let mut consumer = module("base", &[], &[X.required()]);
        consumer.layer = Some("infra".to_owned());
        let batch = vec![provider, consumer];
        let err = resolve_order(&batch, &HashMap::new(), Some(&layer_index()), true).unwrap_err();
        assert!(matches!(
            err,
            DependencyError::LayerViolation {
                ref consumer,
                ref provider,
                ..
            } if consumer == "base" && provider == "app"
        ));
    }

    #[test]
    fn unknown_layer_name_is_rejected() {
        let mut provider = module("base", &[X.erased()], &[]);
        provider.layer = Some("infra".to_owned());
        let mut consumer = module("app", &[], &[X.required()]);
        consumer.layer = Some("mystery".to_owned());
        let batch = vec![provider, consumer];
        let err = resolve_order(&batch, &HashMap::new(), Some(&layer_index()), true).unwrap_err();
        assert!(matches!(
            err,
            DependencyError::UnknownLayer { ref layer, .. } if layer == "mystery"
        ));
    }

    #[test]
    fn key_layer_overrides_the_provider_module_layer() {
        const PINNED: ApiKey<dyn Send> = ApiKey::in_layer("tests.pinned", "product");
        let mut provider = module("base", &[PINNED.erased()], &[]);
        provider.layer = Some("infra".to_owned());
        let mut consumer = module("mid", &[], &[PINNED.required()]);
        consumer.layer = Some("infra".to_owned());
        let batch = vec![provider, consumer];
        let err = resolve_order(&batch, &HashMap::new(), Some(&layer_index()), true).unwrap_err();
        assert!(matches!(err, DependencyError::LayerViolation { .. }));
    }
}
