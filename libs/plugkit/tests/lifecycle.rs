//! End-to-end lifecycle tests: batch installation, dependency
//! resolution, failure containment, removal cascades, and lazy loading.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use plugkit::{
    ApiKey, AppHost, ConfigurationError, DependencyError, EntryPointDef, EntryPointInterceptor,
    HostError, HostOptions, InstallError, InstallPhase, LazyEntryPoint, LifecycleError,
    ShellDescriptor, SlotKey,
};
use serde_json::json;

use common::wait_until;

trait Calculator: Send + Sync {
    fn add(&self, a: i64, b: i64) -> i64;
}

struct FixedCalculator;

impl Calculator for FixedCalculator {
    fn add(&self, a: i64, b: i64) -> i64 {
        a + b
    }
}

const CALCULATOR: ApiKey<dyn Calculator> = ApiKey::new("tests.calculator");

trait Formatter: Send + Sync {
    fn format(&self, n: i64) -> String;
}

struct PlainFormatter;

impl Formatter for PlainFormatter {
    fn format(&self, n: i64) -> String {
        n.to_string()
    }
}

const FORMATTER: ApiKey<dyn Formatter> = ApiKey::new("tests.formatter");

const LABELS: SlotKey<String> = SlotKey::new("tests.labels");

type Events = Arc<Mutex<Vec<String>>>;

fn events() -> Events {
    Arc::new(Mutex::new(Vec::new()))
}

fn recorded(events: &Events) -> Vec<String> {
    events.lock().clone()
}

/// Entry point that records its hook invocations.
fn tracked(name: &str, events: &Events) -> EntryPointDef {
    let (a, e, d) = (events.clone(), events.clone(), events.clone());
    let (an, en, dn) = (name.to_owned(), name.to_owned(), name.to_owned());
    EntryPointDef::new(name)
        .on_attach(move |_| {
            a.lock().push(format!("attach:{an}"));
            Ok(())
        })
        .on_extend(move |_| {
            e.lock().push(format!("extend:{en}"));
            Ok(())
        })
        .on_detach(move |_| {
            d.lock().push(format!("detach:{dn}"));
            Ok(())
        })
}

fn calculator_provider() -> EntryPointDef {
    EntryPointDef::new("calc")
        .provides([CALCULATOR.erased()])
        .on_attach(|shell| {
            shell.contribute_api(&CALCULATOR, Arc::new(FixedCalculator))?;
            Ok(())
        })
}

#[tokio::test]
async fn provider_attaches_before_consumer_in_either_batch_order() {
    for reversed in [false, true] {
        let host = AppHost::default();
        let log = events();

        let provider = tracked("provider", &log)
            .provides([CALCULATOR.erased()])
            .on_attach({
                let log = log.clone();
                move |shell| {
                    log.lock().push("attach:provider".to_owned());
                    shell.contribute_api(&CALCULATOR, Arc::new(FixedCalculator))?;
                    Ok(())
                }
            });
        let consumer = tracked("consumer", &log)
            .requires([CALCULATOR.required()])
            .on_attach({
                let log = log.clone();
                move |shell| {
                    log.lock().push("attach:consumer".to_owned());
                    let calc = shell.get_api(&CALCULATOR)?;
                    assert_eq!(calc.add(2, 3), 5, "provider API is usable during attach");
                    Ok(())
                }
            });

        let batch = if reversed {
            vec![ShellDescriptor::ready(consumer), ShellDescriptor::ready(provider)]
        } else {
            vec![ShellDescriptor::ready(provider), ShellDescriptor::ready(consumer)]
        };
        host.add_shells(batch).await.unwrap();

        assert_eq!(
            recorded(&log),
            vec![
                "attach:provider",
                "attach:consumer",
                "extend:provider",
                "extend:consumer"
            ],
            "reversed={reversed}: providers attach first, extends run after every attach"
        );
    }
}

#[tokio::test]
async fn missing_dependency_aborts_the_batch_before_any_attach() {
    let host = AppHost::default();
    let log = events();

    let err = host
        .add_shells(vec![
            ShellDescriptor::ready(tracked("bystander", &log)),
            ShellDescriptor::ready(
                tracked("needy", &log).requires([FORMATTER.required()]),
            ),
        ])
        .await
        .unwrap_err();

    match err {
        InstallError::Dependency(DependencyError::Missing { module, key }) => {
            assert_eq!(module, "needy");
            assert_eq!(key, "tests.formatter");
        }
        other => panic!("expected a missing dependency, got: {other}"),
    }
    assert!(!host.has_shell("needy"));
    assert!(!host.has_shell("bystander"), "validation is total-or-nothing");
    assert!(recorded(&log).is_empty(), "no hook ran");

    // The names are free again once the dependency is present.
    host.add_shells(vec![
        ShellDescriptor::ready(EntryPointDef::new("fmt").provides([FORMATTER.erased()]).on_attach(
            |shell| {
                shell.contribute_api(&FORMATTER, Arc::new(PlainFormatter))?;
                Ok(())
            },
        )),
        ShellDescriptor::ready(tracked("needy", &log).requires([FORMATTER.required()])),
    ])
    .await
    .unwrap();
    assert!(host.has_shell("needy"));
}

#[tokio::test]
async fn optional_dependency_installs_without_a_provider() {
    let host = AppHost::default();
    host.add_shells(vec![ShellDescriptor::ready(
        EntryPointDef::new("relaxed").requires([FORMATTER.optional()]),
    )])
    .await
    .unwrap();
    assert!(host.has_shell("relaxed"));
}

#[tokio::test]
async fn mutual_dependency_names_both_modules_and_attaches_neither() {
    let host = AppHost::default();
    host.add_shells(vec![ShellDescriptor::ready(calculator_provider())])
        .await
        .unwrap();
    let before = host.all_entry_points();

    let err = host
        .add_shells(vec![
            ShellDescriptor::ready(
                EntryPointDef::new("a")
                    .provides([FORMATTER.erased()])
                    .requires([CALCULATOR.required(), LOOP_X.required()]),
            ),
            ShellDescriptor::ready(
                EntryPointDef::new("b")
                    .provides([LOOP_X.erased()])
                    .requires([FORMATTER.required()]),
            ),
        ])
        .await
        .unwrap_err();

    let InstallError::Dependency(DependencyError::Circular { cycle }) = err else {
        panic!("expected a circular dependency");
    };
    assert!(cycle.contains(&"a".to_owned()), "cycle: {cycle:?}");
    assert!(cycle.contains(&"b".to_owned()), "cycle: {cycle:?}");
    assert!(!host.has_shell("a"));
    assert!(!host.has_shell("b"));
    assert_eq!(host.all_entry_points(), before, "registry unchanged by the failed batch");
}

trait Loop: Send + Sync {}
const LOOP_X: ApiKey<dyn Loop> = ApiKey::new("tests.loop");

#[tokio::test]
async fn layer_violation_fails_the_batch() {
    let options: HostOptions = serde_json::from_value(json!({
        "layers": [
            { "name": "infra", "level": 0 },
            { "name": "product", "level": 1 }
        ]
    }))
    .unwrap();
    let host = AppHost::new(options);

    let err = host
        .add_shells(vec![
            ShellDescriptor::ready(
                EntryPointDef::new("widgets")
                    .in_layer("product")
                    .provides([CALCULATOR.erased()]),
            ),
            ShellDescriptor::ready(
                EntryPointDef::new("base")
                    .in_layer("infra")
                    .requires([CALCULATOR.required()]),
            ),
        ])
        .await
        .unwrap_err();

    match err {
        InstallError::Dependency(DependencyError::LayerViolation {
            consumer, provider, ..
        }) => {
            assert_eq!(consumer, "base");
            assert_eq!(provider, "widgets");
        }
        other => panic!("expected a layer violation, got: {other}"),
    }
    assert!(!host.has_shell("widgets"));
    assert!(!host.has_shell("base"));
}

#[tokio::test]
async fn attach_failure_rolls_back_that_module_only() {
    let host = AppHost::default();
    let log = events();

    let good = tracked("good", &log);
    let bad = EntryPointDef::new("bad")
        .provides([FORMATTER.erased()])
        .on_attach(|shell| {
            // Partial registrations that must all disappear.
            shell.contribute_api(&FORMATTER, Arc::new(PlainFormatter))?;
            shell.contribute_state("bad.counter", 0i64, |_, _| {})?;
            anyhow::bail!("attach exploded");
        });

    let err = host
        .add_shells(vec![ShellDescriptor::ready(good), ShellDescriptor::ready(bad)])
        .await
        .unwrap_err();

    let InstallError::Shells(failures) = err else {
        panic!("expected contained hook failures");
    };
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].module, "bad");
    assert_eq!(failures[0].phase, InstallPhase::Attach);

    assert!(host.has_shell("good"), "siblings are unaffected");
    assert!(!host.has_shell("bad"));
    assert!(
        host.get_api(&FORMATTER).is_err(),
        "partial API registration was rolled back"
    );
    assert!(
        host.store().state::<i64>("bad.counter").is_err(),
        "partial state registration was rolled back"
    );

    // The name is reusable after the rollback.
    host.add_shells(vec![ShellDescriptor::ready(EntryPointDef::new("bad"))])
        .await
        .unwrap();
    assert!(host.has_shell("bad"));
}

#[tokio::test]
async fn extend_failure_does_not_stop_sibling_extends() {
    let host = AppHost::default();
    let log = events();

    let flaky = tracked("flaky", &log).on_extend(|_| anyhow::bail!("extend exploded"));
    let steady = tracked("steady", &log);

    let err = host
        .add_shells(vec![ShellDescriptor::ready(flaky), ShellDescriptor::ready(steady)])
        .await
        .unwrap_err();

    let InstallError::Shells(failures) = err else {
        panic!("expected contained hook failures");
    };
    assert_eq!(failures[0].module, "flaky");
    assert_eq!(failures[0].phase, InstallPhase::Extend);

    assert!(
        recorded(&log).contains(&"extend:steady".to_owned()),
        "sibling extend still ran: {:?}",
        recorded(&log)
    );
    assert!(!host.has_shell("flaky"), "failing module was rolled back");
    assert!(host.has_shell("steady"));
}

#[tokio::test]
async fn duplicate_shell_name_rejects_the_offender_only() {
    let host = AppHost::default();
    let log = events();

    let err = host
        .add_shells(vec![
            ShellDescriptor::ready(tracked("twin", &log)),
            ShellDescriptor::ready(tracked("twin", &log)),
        ])
        .await
        .unwrap_err();

    let InstallError::Shells(failures) = err else {
        panic!("expected a contained rejection");
    };
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].phase, InstallPhase::Registration);
    assert!(
        failures[0]
            .source
            .downcast_ref::<ConfigurationError>()
            .is_some(),
        "source is the configuration error"
    );
    assert!(host.has_shell("twin"), "first registration won");
}

#[tokio::test]
async fn duplicate_api_key_fails_the_second_registrant() {
    let host = AppHost::default();
    host.add_shells(vec![ShellDescriptor::ready(calculator_provider())])
        .await
        .unwrap();

    let rival = EntryPointDef::new("rival").on_attach(|shell| {
        shell.contribute_api(&CALCULATOR, Arc::new(FixedCalculator))?;
        Ok(())
    });
    let err = host
        .add_shells(vec![ShellDescriptor::ready(rival)])
        .await
        .unwrap_err();

    let InstallError::Shells(failures) = err else {
        panic!("expected a contained attach failure");
    };
    assert_eq!(failures[0].module, "rival");
    assert!(!host.has_shell("rival"));
    assert_eq!(
        host.get_api(&CALCULATOR).unwrap().add(1, 1),
        2,
        "original provider is untouched"
    );

    // After the owner detaches, the key is available again.
    host.remove_shells(&["calc"]).await;
    assert!(host.get_api(&CALCULATOR).is_err());
    host.add_shells(vec![ShellDescriptor::ready(
        EntryPointDef::new("rival").on_attach(|shell| {
            shell.contribute_api(&CALCULATOR, Arc::new(FixedCalculator))?;
            Ok(())
        }),
    )])
    .await
    .unwrap();
    assert!(host.get_api(&CALCULATOR).is_ok());
}

#[tokio::test]
async fn api_access_fails_fast_until_dependencies_are_satisfied() {
    let host = AppHost::default();
    let seen: Arc<Mutex<Option<HostError>>> = Arc::new(Mutex::new(None));

    let broken_provider = EntryPointDef::new("provider")
        .provides([CALCULATOR.erased()])
        .on_attach(|_| anyhow::bail!("never registers its API"));
    let seen_in = seen.clone();
    let consumer = EntryPointDef::new("consumer")
        .requires([CALCULATOR.required()])
        .on_attach(move |shell| {
            *seen_in.lock() = shell.get_api(&CALCULATOR).err();
            Ok(())
        });

    let _ = host
        .add_shells(vec![
            ShellDescriptor::ready(broken_provider),
            ShellDescriptor::ready(consumer),
        ])
        .await;

    let guard = seen.lock();
    match guard.as_ref() {
        Some(HostError::Lifecycle(LifecycleError::ApisNotReady { module, key })) => {
            assert_eq!(module, "consumer");
            assert_eq!(key, "tests.calculator");
        }
        other => panic!("expected a lifecycle guard, got: {other:?}"),
    }
}

#[tokio::test]
async fn removal_cascades_items_apis_and_declared_slots() {
    let host = AppHost::default();

    let provider = EntryPointDef::new("provider")
        .provides([CALCULATOR.erased()])
        .on_attach(|shell| {
            shell.declare_slot(&LABELS)?;
            shell.contribute_api(&CALCULATOR, Arc::new(FixedCalculator))?;
            Ok(())
        });
    let decorator = EntryPointDef::new("decorator")
        .requires([CALCULATOR.required()])
        .on_attach(|shell| {
            let slot = shell.get_slot(&LABELS)?;
            slot.contribute(shell, "from-decorator".to_owned(), None);
            Ok(())
        });
    host.add_shells(vec![
        ShellDescriptor::ready(provider),
        ShellDescriptor::ready(decorator),
    ])
    .await
    .unwrap();

    let slot = host.get_slot(&LABELS).unwrap();
    assert_eq!(slot.get_items(false).len(), 1);

    host.remove_shells(&["decorator"]).await;
    assert!(
        slot.get_items(true).is_empty(),
        "detach removed the module's items from the slot"
    );
    assert!(host.get_api(&CALCULATOR).is_ok(), "provider untouched");

    host.remove_shells(&["provider"]).await;
    assert!(host.get_api(&CALCULATOR).is_err(), "API unregistered");
    assert!(
        !host.all_slot_keys().contains(&"tests.labels".to_owned()),
        "declared slot was discarded with its owner"
    );
}

#[tokio::test]
async fn shells_detach_in_reverse_dependency_order() {
    let host = AppHost::default();
    let log = events();

    host.add_shells(vec![
        ShellDescriptor::ready(
            tracked("base", &log)
                .provides([CALCULATOR.erased()])
                .on_attach(|shell| {
                    shell.contribute_api(&CALCULATOR, Arc::new(FixedCalculator))?;
                    Ok(())
                }),
        ),
        ShellDescriptor::ready(tracked("mid", &log).requires([CALCULATOR.required()])),
        ShellDescriptor::ready(tracked("top", &log).requires([CALCULATOR.required()])),
    ])
    .await
    .unwrap();

    log.lock().clear();
    host.shutdown().await;

    assert_eq!(
        recorded(&log),
        vec!["detach:top", "detach:mid", "detach:base"],
        "dependents detach before their providers"
    );
    assert!(host.all_entry_points().is_empty());
}

#[tokio::test]
async fn detach_hook_failure_still_completes_the_removal() {
    let host = AppHost::default();
    host.add_shells(vec![ShellDescriptor::ready(
        EntryPointDef::new("grumpy").on_detach(|_| anyhow::bail!("refusing to leave")),
    )])
    .await
    .unwrap();

    host.remove_shells(&["grumpy"]).await;
    assert!(!host.has_shell("grumpy"));
}

#[tokio::test]
async fn shells_changed_callbacks_observe_every_batch() {
    let host = AppHost::default();
    let snapshots: Arc<Mutex<Vec<Vec<String>>>> = Arc::new(Mutex::new(Vec::new()));
    let snaps = snapshots.clone();
    let id = host.on_shells_changed(move |names| {
        snaps.lock().push(names.to_vec());
    });

    host.add_shells(vec![
        ShellDescriptor::ready(EntryPointDef::new("a")),
        ShellDescriptor::ready(EntryPointDef::new("b")),
    ])
    .await
    .unwrap();
    host.remove_shells(&["a"]).await;

    {
        let snaps = snapshots.lock();
        assert_eq!(snaps.len(), 2);
        assert_eq!(snaps[0], vec!["a".to_owned(), "b".to_owned()]);
        assert_eq!(snaps[1], vec!["b".to_owned()]);
    }

    host.remove_shells_changed_callback(id);
    host.remove_shells(&["b"]).await;
    assert_eq!(snapshots.lock().len(), 2, "removed callback no longer fires");
}

#[tokio::test]
async fn interceptors_decorate_entry_points_at_registration() {
    struct Renamer;
    impl EntryPointInterceptor for Renamer {
        fn intercept_name(&self, inner: String) -> String {
            format!("{inner}.v2")
        }
    }

    let host = AppHost::default();
    host.add_interceptor(Arc::new(Renamer));
    host.add_shells(vec![ShellDescriptor::ready(EntryPointDef::new("core"))])
        .await
        .unwrap();

    assert!(host.has_shell("core.v2"));
    assert!(!host.has_shell("core"));
}

#[tokio::test]
async fn one_batch_produces_one_store_notification() {
    let host = AppHost::default();
    let notifications = Arc::new(AtomicUsize::new(0));
    let n = notifications.clone();
    let store = host.store();
    let _sub = store.subscribe(move || {
        n.fetch_add(1, Ordering::SeqCst);
    });

    host.add_shells(vec![
        ShellDescriptor::ready(EntryPointDef::new("left").on_attach(|shell| {
            shell.contribute_state("left.count", 0u32, |_, _| {})?;
            Ok(())
        })),
        ShellDescriptor::ready(EntryPointDef::new("right").on_attach(|shell| {
            shell.contribute_state("right.count", 0u32, |_, _| {})?;
            shell.declare_slot(&LABELS)?;
            Ok(())
        })),
    ])
    .await
    .unwrap();

    assert_eq!(
        notifications.load(Ordering::SeqCst),
        1,
        "all registrations in the batch coalesced into one notification"
    );
}

#[tokio::test]
async fn lazy_entry_point_is_spliced_in_once_resolved() {
    let host = AppHost::default();
    let (tx, rx) = tokio::sync::oneshot::channel::<()>();

    host.add_shells(vec![ShellDescriptor::from(LazyEntryPoint::new(
        "deferred",
        move || async move {
            let _ = rx.await;
            Ok(Box::new(calculator_provider_named("deferred")) as Box<dyn plugkit::EntryPoint>)
        },
    ))])
    .await
    .unwrap();

    assert!(host.is_lazy_entry_point("deferred"));
    assert!(!host.has_shell("deferred"));
    let info = host
        .all_entry_points()
        .into_iter()
        .find(|i| i.name == "deferred")
        .unwrap();
    assert!(info.lazy);
    assert!(!info.attached);

    tx.send(()).unwrap();
    wait_until(|| host.has_shell("deferred")).await;
    assert!(!host.is_lazy_entry_point("deferred"));
    assert!(host.get_api(&CALCULATOR).is_ok(), "lazy module registered its API");
}

fn calculator_provider_named(name: &str) -> EntryPointDef {
    EntryPointDef::new(name)
        .provides([CALCULATOR.erased()])
        .on_attach(|shell| {
            shell.contribute_api(&CALCULATOR, Arc::new(FixedCalculator))?;
            Ok(())
        })
}

#[tokio::test]
async fn lazy_result_is_discarded_when_removed_before_resolution() {
    let host = AppHost::default();
    let (tx, rx) = tokio::sync::oneshot::channel::<()>();
    let resolved = Arc::new(AtomicUsize::new(0));
    let resolved_in = resolved.clone();

    host.add_shells(vec![ShellDescriptor::from(LazyEntryPoint::new(
        "fickle",
        move || async move {
            let _ = rx.await;
            resolved_in.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(EntryPointDef::new("fickle")) as Box<dyn plugkit::EntryPoint>)
        },
    ))])
    .await
    .unwrap();

    host.remove_shells(&["fickle"]).await;
    assert!(!host.is_lazy_entry_point("fickle"));

    tx.send(()).unwrap();
    wait_until(|| resolved.load(Ordering::SeqCst) == 1).await;
    // Give the discarded install a chance to (incorrectly) happen.
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    assert!(!host.has_shell("fickle"), "resolved module was discarded");
    assert!(host.all_entry_points().is_empty());
}
