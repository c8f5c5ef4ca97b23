use flagwise::{ClientConfig, FlagsContext};

#[tokio::main(flavor = "current_thread")]
async fn main() {
    // Configure env_logger to see flagwise logs.
    env_logger::Builder::from_env(env_logger::Env::new().default_filter_or("flagwise")).init();

    let publishable_key = std::env::var("FLAGWISE_PUBLISHABLE_KEY")
        .expect("FLAGWISE_PUBLISHABLE_KEY env variable should contain publishable key");
    let storage_dir = std::env::temp_dir().join("flagwise-demo");
    std::fs::create_dir_all(&storage_dir).expect("should be able to create storage directory");

    let client = ClientConfig::from_publishable_key(publishable_key)
        .storage_dir(&storage_dir)
        .stale_while_revalidate(true)
        .fallback_flag("huddles")
        .context(FlagsContext::new().with_user("id", "test-user"))
        .to_client();

    let _subscription = client.on_updated(|| println!("flags updated"));

    // Never fails: falls back to cached or fallback flags when the service is unreachable.
    let state = client.initialize().await;
    println!("Resolved flags: {:?}", state);

    for (key, flag) in client.get_flags().iter() {
        println!("{key}: {}", flag.is_enabled());
    }

    println!("huddles enabled: {}", client.is_enabled("huddles"));

    // Give background refreshes and check events a moment to complete before exiting.
    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
}
