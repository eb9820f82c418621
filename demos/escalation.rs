//! End-to-end escalation against a throwaway `PostgreSQL` database
//!
//! Seeds a service with a two-step escalation policy, sends the same alert
//! three times and lets a runner work through the escalation jobs.
//!
//! ```bash
//! cargo run --example escalation
//! ```

use anyhow::Result;
use incident_engine::{
    Engine, EngineConfig, EventPayload, LogDispatcher, PgStore, Runner, SystemClock,
    setup_database,
};
use serde_json::json;
use sqlx::PgPool;
use testcontainers::ContainerAsync;
use testcontainers::runners::AsyncRunner;
use testcontainers_modules::postgres::Postgres;
use tracing::info;

/// Set up a `PostgreSQL` database using `TestContainers`
#[allow(clippy::cognitive_complexity)]
async fn start_database() -> Result<(PgPool, ContainerAsync<Postgres>)> {
    info!("Starting PostgreSQL container...");
    let container = Postgres::default().start().await?;

    let host = container.get_host().await?;
    let port = container.get_host_port_ipv4(5432).await?;
    let connection_string = format!("postgresql://postgres:postgres@{host}:{port}/postgres");

    info!("Connecting to database at {}:{}...", host, port);
    let pool = PgPool::connect(&connection_string).await?;

    info!("Running database migrations...");
    setup_database(&pool).await?;

    Ok((pool, container))
}

async fn seed(pool: &PgPool) -> Result<()> {
    let statements = [
        "INSERT INTO users (id, name, notification_channels) VALUES
            ('alice', 'Alice', '{SLACK,SMS}'),
            ('bob', 'Bob', '{EMAIL}'),
            ('carol', 'Carol', '{}')",
        "INSERT INTO teams (id, name, lead_id) VALUES ('dba', 'Database', 'carol')",
        "INSERT INTO team_members (team_id, user_id, position) VALUES ('dba', 'bob', 0), ('dba', 'carol', 1)",
        "INSERT INTO escalation_policies (id, name) VALUES ('database', 'Database')",
        "INSERT INTO escalation_steps (policy_id, step_order, delay_minutes, target_type, target_id) VALUES
            ('database', 1, 0, 'USER', 'alice'),
            ('database', 2, 0, 'TEAM', 'dba')",
        "INSERT INTO services (id, name, escalation_policy_id, team_id)
            VALUES ('postgres-primary', 'Postgres primary', 'database', 'dba')",
    ];
    for statement in statements {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn,escalation=info,incident_engine=info".into()),
        )
        .compact()
        .init();

    let (pool, _container) = start_database().await?;
    seed(&pool).await?;

    let engine = Engine::with_config(
        PgStore::new(pool),
        LogDispatcher,
        SystemClock,
        EngineConfig::default().immediate_first_step(false),
    );

    let mut incident_id = None;
    for _ in 0..3 {
        let event = EventPayload::from_json(json!({
            "event_action": "trigger",
            "dedup_key": "replication-lag",
            "payload": {
                "summary": "Replication lag above 30s",
                "source": "prometheus",
                "severity": "critical",
                "custom_details": { "lag_seconds": 42 }
            }
        }))?;
        let outcome = engine
            .process_event(event, "postgres-primary", "prometheus")
            .await?;
        info!(action = ?outcome.action, incident.id = ?outcome.incident_id, "Processed event");
        incident_id = incident_id.or(outcome.incident_id);
    }

    info!("Processing escalation jobs...");
    Runner::new(engine.clone())
        .num_workers(2)
        .shutdown_when_queue_empty()
        .start()
        .wait_for_shutdown()
        .await;

    let Some(incident_id) = incident_id else {
        anyhow::bail!("no incident was opened");
    };
    for event in engine.incident_timeline(incident_id).await? {
        info!("{}  {}", event.created_at.to_rfc3339(), event.message);
    }
    for notification in engine.incident_notifications(incident_id).await? {
        info!(
            user = %notification.user_id,
            channel = ?notification.channel,
            status = ?notification.status,
            "Notification"
        );
    }

    Ok(())
}
