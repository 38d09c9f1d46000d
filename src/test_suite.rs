use testcontainers::core::{ContainerAsync, IntoContainerPort, WaitFor};
use testcontainers::runners::AsyncRunner;
use testcontainers::{GenericImage, ImageExt};

/// Start a throwaway Redis and return its URL. Keep the container alive for the test.
pub async fn setup_redis_test_environment() -> (String, ContainerAsync<GenericImage>) {
    let container = GenericImage::new("redis", "alpine3.22")
        .with_exposed_port(6379.tcp())
        .with_wait_for(WaitFor::message_on_stdout("Ready to accept connections"))
        .with_network("bridge")
        .start()
        .await
        .expect("Failed to start Redis");

    let host = container.get_host().await.expect("Failed to get host");
    let host_port = container
        .get_host_port_ipv4(6379)
        .await
        .expect("Failed to get host port");

    (format!("redis://{host}:{host_port}"), container)
}

/// Route `tracing` output to the test harness. Safe to call from every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
