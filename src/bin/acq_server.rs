use acq_server::config::Config;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
	env_logger::init();

	let config_s = std::fs::read_to_string("config.toml")?;
	let config: Config = toml::from_str(&config_s)?;

	let built = config.build()?;
	let mut supervisor = built.supervisor;
	supervisor
		.connect(built.driver, built.hooks, (built.listen_address.as_str(), built.listen_port), built.samples_per_block, built.pipeline_config)
		.await?;
	supervisor.start().await?;

	log::info!("acquisition server listening on {}:{}", built.listen_address, built.listen_port);

	loop {
		tokio::time::sleep(std::time::Duration::from_secs(20)).await;
		let status = supervisor.status();
		if let Some(err) = &status.last_error {
			log::warn!("last reported error: {}", err);
		}
	}
}
