use evbus::contract::{EventFamily, FieldType, Schema};
use evbus::eventing::{DeliveryMode, Dispatcher, SubscribeOptions, handler_fn, typed_handler};
use evbus::outbox::{DurablePublisher, InMemoryOutboxStore, RedeliveryConfig, RedeliveryWorker};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "typeTag", content = "payload", rename_all_fields = "camelCase")]
enum ExperienceEvent {
    #[serde(rename = "experience.created")]
    Created {
        experience_id: i64,
        author_id: i64,
        title: String,
    },
}

impl EventFamily for ExperienceEvent {
    fn definitions() -> Vec<(&'static str, Schema)> {
        vec![(
            "experience.created",
            Schema::new()
                .required("experienceId", FieldType::Int)
                .required("authorId", FieldType::Int)
                .required("title", FieldType::String),
        )]
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    // 启动阶段：定义契约、注册订阅，然后冻结
    let dispatcher = Arc::new(Dispatcher::builder().build());
    dispatcher.catalog().define_family::<ExperienceEvent>()?;
    dispatcher.define(
        "user.signed_up",
        Schema::new().required("userId", FieldType::Int),
    )?;

    let _feed = dispatcher.subscribe(
        "experience.created",
        typed_handler::<ExperienceEvent, _, _>("feed", |_, event| async move {
            let ExperienceEvent::Created { experience_id, title, .. } = event;
            info!(experience_id, %title, "feed updated");
            Ok(())
        }),
        SubscribeOptions::default(),
    )?;

    // 前两次失败，由重投工作者补偿
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = attempts.clone();
    let _notify = dispatcher.subscribe(
        "experience.created",
        handler_fn("notify", move |_| {
            let counter = counter.clone();
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                anyhow::ensure!(n > 2, "mail relay unavailable (attempt {n})");
                Ok(())
            }
        }),
        SubscribeOptions::builder().order(10).build(),
    )?;

    let _welcome = dispatcher.subscribe(
        "user.signed_up",
        handler_fn("welcome", |event| async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            info!(user_id = ?event.field("userId"), "welcome mail sent");
            Ok(())
        }),
        SubscribeOptions::builder()
            .mode(DeliveryMode::FireAndForget)
            .build(),
    )?;
    dispatcher.freeze_registry();

    let mut failures = dispatcher.failures();
    tokio::spawn(async move {
        while let Some(report) = failures.next().await {
            info!(handler = %report.handler, error = %report.error, "failure observed");
        }
    });

    // 直接发布
    let signup = dispatcher.construct("user.signed_up", serde_json::json!({ "userId": 7 }))?;
    let outcome = dispatcher.publish(signup).await?;
    info!(event_id = %outcome.event_id, handlers = outcome.handlers.len(), "signup published");

    // 持久化发布 + 重投
    let store = InMemoryOutboxStore::new();
    let publisher = Arc::new(
        DurablePublisher::builder()
            .dispatcher(dispatcher.clone())
            .store(Arc::new(store.clone()))
            .config(RedeliveryConfig {
                poll_interval: Duration::from_millis(50),
                backoff_base: Duration::from_millis(50),
                ..Default::default()
            })
            .build(),
    );
    let worker = Arc::new(
        RedeliveryWorker::builder()
            .publisher(publisher.clone())
            .build(),
    );
    let handle = worker.start();

    let event = dispatcher.catalog().construct_from(&ExperienceEvent::Created {
        experience_id: 42,
        author_id: 7,
        title: "Trail running in the Alps".into(),
    })?;
    let delivery = publisher.publish_durable(event).await?;
    info!(event_id = %delivery.event_id, status = %delivery.status, "experience published");

    for _ in 0..40 {
        if store
            .records()
            .iter()
            .all(|r| r.status().is_terminal())
        {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    handle.shutdown();
    handle.join().await;
    dispatcher.drain(Duration::from_secs(5)).await?;

    for record in store.records() {
        info!(
            event_id = %record.event_id(),
            status = %record.status(),
            attempts = record.attempt_count(),
            "outbox record"
        );
    }
    Ok(())
}
