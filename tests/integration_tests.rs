//! End-to-end tests: registrar, elected scheduler and task records in one
//! shared in-memory store.


use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use action_scheduler::config::SchedulerConfig;
use action_scheduler::scheduler::{
    register_action, unregister_action, ActionDefinition, ActionDispatcher, Scheduler,
    TaskRecordHandler,
};
use action_scheduler::store::{key_base, CoordinationStore, MemoryStore};
use test_harness::{test_config, wait_for};

const TASK_TYPE: &str = "scale-check";

fn task_scheduler(store: &MemoryStore, config: &SchedulerConfig) -> Scheduler {
    let store: Arc<dyn CoordinationStore> = Arc::new(store.clone());
    let dispatcher = ActionDispatcher::new().with_handler(
        TASK_TYPE,
        TaskRecordHandler::new(store.clone(), config.tasks_prefix()),
    );
    Scheduler::new(config.clone(), store, dispatcher).unwrap()
}

async fn task_ids(store: &MemoryStore, config: &SchedulerConfig) -> Vec<String> {
    let ids: HashSet<String> = store
        .list(&config.tasks_prefix())
        .await
        .unwrap()
        .into_iter()
        .filter_map(|pair| {
            pair.key
                .strip_prefix(&config.tasks_prefix())
                .and_then(|rest| rest.split('/').next())
                .map(str::to_string)
        })
        .collect();
    let mut ids: Vec<String> = ids.into_iter().collect();
    ids.sort();
    ids
}

async fn task_field(store: &MemoryStore, config: &SchedulerConfig, task: &str, field: &str) -> Option<String> {
    store
        .get(&format!("{}{}/{}", config.tasks_prefix(), task, field))
        .await
        .unwrap()
}

#[tokio::test]
async fn test_registered_action_produces_task_records() {
    let store = MemoryStore::new();
    let config = test_config();
    let scheduler = task_scheduler(&store, &config);
    scheduler.start();

    let definition = ActionDefinition::new(TASK_TYPE, "dep-1", "100ms")
        .with_id("a1")
        .with_data("node", "compute");
    register_action(&store, &config, &definition).await.unwrap();

    let (st, cfg) = (store.clone(), config.clone());
    assert!(wait_for(Duration::from_secs(3), || {
        let (st, cfg) = (st.clone(), cfg.clone());
        async move { !task_ids(&st, &cfg).await.is_empty() }
    })
    .await);

    let tasks = task_ids(&store, &config).await;
    let task = &tasks[0];
    assert_eq!(task_field(&store, &config, task, "actionID").await.as_deref(), Some("a1"));
    assert_eq!(task_field(&store, &config, task, "deploymentID").await.as_deref(), Some("dep-1"));
    assert_eq!(task_field(&store, &config, task, "type").await.as_deref(), Some(TASK_TYPE));
    assert_eq!(task_field(&store, &config, task, "status").await.as_deref(), Some("initial"));
    assert_eq!(task_field(&store, &config, task, "data/node").await.as_deref(), Some("compute"));
    let created = task_field(&store, &config, task, "creationDate").await.unwrap();
    assert!(chrono::DateTime::parse_from_rfc3339(&created).is_ok());

    scheduler.stop().await;
}

#[tokio::test]
async fn test_pending_task_holds_back_the_next_one() {
    let store = MemoryStore::new();
    let config = test_config();
    let scheduler = task_scheduler(&store, &config);
    scheduler.start();

    register_action(
        &store,
        &config,
        &ActionDefinition::new(TASK_TYPE, "dep-1", "100ms").with_id("a1"),
    )
    .await
    .unwrap();

    let (st, cfg) = (store.clone(), config.clone());
    assert!(wait_for(Duration::from_secs(3), || {
        let (st, cfg) = (st.clone(), cfg.clone());
        async move { task_ids(&st, &cfg).await.len() == 1 }
    })
    .await);

    // Several ticks pass while the task is still initial
    tokio::time::sleep(Duration::from_millis(400)).await;
    let tasks = task_ids(&store, &config).await;
    assert_eq!(tasks.len(), 1);

    store
        .put(&format!("{}{}/status", config.tasks_prefix(), tasks[0]), "done")
        .await
        .unwrap();
    let (st, cfg) = (store.clone(), config.clone());
    assert!(wait_for(Duration::from_secs(2), || {
        let (st, cfg) = (st.clone(), cfg.clone());
        async move { task_ids(&st, &cfg).await.len() == 2 }
    })
    .await);

    scheduler.stop().await;
}

#[tokio::test]
async fn test_unregister_stops_task_production() {
    let store = MemoryStore::new();
    let config = test_config();
    let scheduler = task_scheduler(&store, &config);
    scheduler.start();

    register_action(
        &store,
        &config,
        &ActionDefinition::new(TASK_TYPE, "dep-1", "100ms").with_id("a1"),
    )
    .await
    .unwrap();

    let (st, cfg) = (store.clone(), config.clone());
    assert!(wait_for(Duration::from_secs(3), || {
        let (st, cfg) = (st.clone(), cfg.clone());
        async move { !task_ids(&st, &cfg).await.is_empty() }
    })
    .await);

    unregister_action(&store, &config, "a1").await.unwrap();
    let (st, cfg) = (store.clone(), config.clone());
    assert!(wait_for(Duration::from_secs(3), || {
        let (st, cfg) = (st.clone(), cfg.clone());
        async move { st.list(&format!("{}/", cfg.action_path("a1"))).await.unwrap().is_empty() }
    })
    .await);

    // Completing the task would allow a new one if the action were still alive
    for task in task_ids(&store, &config).await {
        store
            .put(&format!("{}{}/status", config.tasks_prefix(), task), "done")
            .await
            .unwrap();
    }
    let produced = task_ids(&store, &config).await.len();
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(task_ids(&store, &config).await.len(), produced);

    scheduler.stop().await;
}

#[tokio::test]
async fn test_actions_keyspace_lists_one_key_per_action() {
    let store = MemoryStore::new();
    let config = test_config();
    for id in ["a1", "a2"] {
        register_action(
            &store,
            &config,
            &ActionDefinition::new(TASK_TYPE, "dep-1", "1m")
                .with_id(id)
                .with_data("node", "compute"),
        )
        .await
        .unwrap();
    }

    let (keys, meta) = store
        .keys(
            &config.actions_prefix(),
            Some("/"),
            &action_scheduler::store::QueryOptions::default(),
        )
        .await
        .unwrap();
    let ids: Vec<&str> = keys.iter().map(|k| key_base(k)).collect();
    assert_eq!(ids, vec!["a1", "a2"]);
    assert!(keys.iter().all(|k| k.ends_with('/')));
    assert!(meta.last_index >= 1);
}

#[tokio::test]
async fn test_unregistered_action_leaves_no_task_bookkeeping() {
    let store = MemoryStore::new();
    let config = test_config();
    let backend: Arc<dyn CoordinationStore> = Arc::new(store.clone());
    let handler = Arc::new(TaskRecordHandler::new(backend.clone(), config.tasks_prefix()));
    let mut dispatcher = ActionDispatcher::new();
    dispatcher.register(TASK_TYPE, handler.clone());
    let scheduler = Scheduler::new(config.clone(), backend, dispatcher).unwrap();
    scheduler.start();

    register_action(
        &store,
        &config,
        &ActionDefinition::new(TASK_TYPE, "dep-1", "100ms").with_id("a1"),
    )
    .await
    .unwrap();
    let h = handler.clone();
    assert!(wait_for(Duration::from_secs(3), || {
        let h = h.clone();
        async move { h.remembered_actions() == 1 }
    })
    .await);

    unregister_action(&store, &config, "a1").await.unwrap();
    let h = handler.clone();
    assert!(wait_for(Duration::from_secs(3), || {
        let h = h.clone();
        async move { h.remembered_actions() == 0 }
    })
    .await);
    assert!(scheduler.tracked_actions().await.is_empty());

    scheduler.stop().await;
}
