#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]
#![allow(dead_code)]

use std::env;
use std::path::Path;
use std::time::Duration;

use anyhow::{Result, bail};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use testcontainers_modules::testcontainers::{ContainerAsync, GenericImage, ImageExt, core::IntoContainerPort, runners::AsyncRunner};
use tokio::time::sleep;

const POSTGRES_TAG: &str = "16";
const CONNECT_ATTEMPTS: u32 = 60;

fn socket_exists(host: &str) -> bool {
    if let Some(path) = host.strip_prefix("unix://") {
        Path::new(path).exists()
    } else {
        true
    }
}

fn testcontainers_runtime_candidates() -> Vec<String> {
    let mut candidates = vec!["unix:///var/run/docker.sock".to_string()];
    if let Ok(runtime_dir) = env::var("XDG_RUNTIME_DIR")
        && !runtime_dir.is_empty()
    {
        candidates.push(format!("unix://{runtime_dir}/.docker/run/docker.sock"));
    }
    if let Ok(home) = env::var("HOME")
        && !home.is_empty()
    {
        candidates.push(format!("unix://{home}/.docker/run/docker.sock"));
        candidates.push(format!("unix://{home}/.docker/desktop/docker.sock"));
    }
    candidates
}

fn detect_podman_socket() -> Option<String> {
    let mut candidates = vec![
        "unix:///run/podman/podman.sock".to_string(),
        "unix:///var/run/podman/podman.sock".to_string(),
    ];
    if let Ok(runtime_dir) = env::var("XDG_RUNTIME_DIR")
        && !runtime_dir.is_empty()
    {
        candidates.push(format!("unix://{runtime_dir}/podman/podman.sock"));
    }
    candidates.into_iter().find(|candidate| socket_exists(candidate))
}

fn find_container_runtime() -> Option<String> {
    if let Ok(existing) = env::var("DOCKER_HOST")
        && !existing.is_empty()
        && socket_exists(&existing)
    {
        return Some(existing);
    }
    testcontainers_runtime_candidates().into_iter().find(|candidate| socket_exists(candidate))
}

fn should_require_container_runtime() -> bool {
    let in_ci = env::var("CI").ok().is_some_and(|value| value.eq_ignore_ascii_case("true"));
    let force = env::var("AURORA_RESILIENT_PG_REQUIRE_TESTCONTAINERS")
        .ok()
        .is_some_and(|value| matches!(value.as_str(), "1" | "true" | "TRUE"));
    in_ci || force
}

/// Returns `Ok(false)` (meaning: skip the calling test) when no container
/// runtime is reachable and the environment does not demand one.
pub fn ensure_container_runtime_for_test(test_name: &str) -> Result<bool> {
    // Attempt to initialize tracing, ignore if already initialized.
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_test_writer()
        .try_init();

    if find_container_runtime().is_some() {
        return Ok(true);
    }

    let mut message = format!("No container runtime socket found (checked Podman + Docker), cannot run {test_name}");
    if let Some(podman_socket) = detect_podman_socket() {
        message.push_str(". Podman socket detected at ");
        message.push_str(&podman_socket);
        message.push_str("; set DOCKER_HOST to this value so testcontainers can use it");
    }

    if should_require_container_runtime() {
        bail!("{message}");
    }
    eprintln!("{message}; skipping");
    Ok(false)
}

/// Starts a single disposable Postgres container and seeds the two
/// single-row canary tables the probes and the replication-lag measurement
/// depend on, plus a stub `aurora_replica_status()` table function so the
/// Aurora-specific replica-status query can be exercised on vanilla
/// Postgres.
pub async fn start_seeded_postgres() -> Result<(ContainerAsync<GenericImage>, PgPool)> {
    let container = GenericImage::new("postgres", POSTGRES_TAG)
        .with_exposed_port(5432.tcp())
        .with_env_var("POSTGRES_USER", "postgres")
        .with_env_var("POSTGRES_PASSWORD", "postgres")
        .with_env_var("POSTGRES_DB", "postgres")
        .with_env_var("POSTGRES_HOST_AUTH_METHOD", "trust")
        .start()
        .await?;

    let host = container.get_host().await?.to_string();
    let port = container.get_host_port_ipv4(5432.tcp()).await?;
    let pool = connect_with_retry(&host, port).await?;
    seed_schema(&pool).await?;

    Ok((container, pool))
}

pub async fn connect_with_retry(host: &str, port: u16) -> Result<PgPool> {
    let dsn = format!("postgres://postgres:postgres@{host}:{port}/postgres?sslmode=disable");
    let mut last_error = None;

    for _ in 0..CONNECT_ATTEMPTS {
        match PgPoolOptions::new().max_connections(10).connect(&dsn).await {
            Ok(pool) => return Ok(pool),
            Err(error) => {
                last_error = Some(error);
                sleep(Duration::from_millis(500)).await;
            }
        }
    }

    bail!("failed to connect to {dsn}; last_error={last_error:?}")
}

async fn seed_schema(pool: &PgPool) -> Result<()> {
    sqlx::query("CREATE TABLE canary (id bigint NOT NULL, ts timestamp NOT NULL)")
        .execute(pool)
        .await?;
    sqlx::query("INSERT INTO canary (id, ts) VALUES (0, CURRENT_TIMESTAMP)")
        .execute(pool)
        .await?;

    sqlx::query("CREATE TABLE replication_canary (id bigint NOT NULL, ts timestamp NOT NULL)")
        .execute(pool)
        .await?;
    sqlx::query("INSERT INTO replication_canary (id, ts) VALUES (0, CURRENT_TIMESTAMP)")
        .execute(pool)
        .await?;

    // Stub of Aurora's server-side `aurora_replica_status()` table function,
    // backed by a regular table so S6 (replica-status filtering) can run
    // against vanilla Postgres.
    sqlx::query(
        "CREATE TABLE aurora_replica_status_rows (
            server_id text NOT NULL,
            session_id text NOT NULL,
            last_update_timestamp timestamp NOT NULL
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE FUNCTION aurora_replica_status() RETURNS TABLE (
            server_id text, session_id text, last_update_timestamp timestamp
        ) AS $$
            SELECT server_id, session_id, last_update_timestamp FROM aurora_replica_status_rows
        $$ LANGUAGE sql STABLE",
    )
    .execute(pool)
    .await?;

    Ok(())
}
