//! Container helpers shared by the integration tests.

#![allow(dead_code)]

use std::time::Duration;

use testcontainers::{
    core::{IntoContainerPort, WaitFor},
    runners::AsyncRunner,
    ContainerAsync, GenericImage, ImageExt,
};

/// Start PostgreSQL 16.
///
/// Returns (container, connection_string). Keep the container alive for the
/// duration of the test.
pub async fn start_postgres() -> (ContainerAsync<GenericImage>, String) {
    // PostgreSQL prints the ready message twice (initdb, then real start).
    let container = GenericImage::new("postgres", "16")
        .with_exposed_port(5432.tcp())
        .with_wait_for(WaitFor::message_on_stdout(
            "database system is ready to accept connections",
        ))
        .with_env_var("POSTGRES_USER", "ferry")
        .with_env_var("POSTGRES_PASSWORD", "ferry")
        .with_env_var("POSTGRES_DB", "ferry")
        .with_startup_timeout(Duration::from_secs(60))
        .start()
        .await
        .expect("Failed to start postgres container");

    tokio::time::sleep(Duration::from_secs(1)).await;

    let host = container
        .get_host()
        .await
        .expect("Failed to get container host");
    let port = container
        .get_host_port_ipv4(5432)
        .await
        .expect("Failed to get mapped port");

    let url = format!("postgres://ferry:ferry@{}:{}/ferry", host, port);
    println!("PostgreSQL available at: {}", url);
    (container, url)
}

/// Start Redis 7.
pub async fn start_redis() -> (ContainerAsync<GenericImage>, String) {
    let container = GenericImage::new("redis", "7")
        .with_exposed_port(6379.tcp())
        .with_wait_for(WaitFor::message_on_stdout("Ready to accept connections"))
        .with_startup_timeout(Duration::from_secs(60))
        .start()
        .await
        .expect("Failed to start redis container");

    let host = container
        .get_host()
        .await
        .expect("Failed to get container host");
    let port = container
        .get_host_port_ipv4(6379)
        .await
        .expect("Failed to get mapped port");

    let url = format!("redis://{}:{}", host, port);
    println!("Redis available at: {}", url);
    (container, url)
}
