use clap::Parser;
use imagevm::{
    cli::{AnsiStyles, ImageVmArgs, ImageVmSubcommand},
    oci::{DockerRegistry, OciStore},
    pipeline::PipelineController,
    rootfs::SystemHost,
};
use tracing_subscriber::{fmt, EnvFilter};

//--------------------------------------------------------------------------------------------------
// Functions: main
//--------------------------------------------------------------------------------------------------

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = ImageVmArgs::parse();

    // RUST_LOG wins over --verbose
    let default_level = if args.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    fmt()
        .with_target(false)
        .with_file(false)
        .with_line_number(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_level(true)
        .with_env_filter(filter)
        .init();

    let (image, options) = args.subcommand.parts();
    let config = options.to_config();

    let registry = DockerRegistry::new().with_platform(config.get_platform().clone());
    let store = OciStore::new(config.get_store_path()).with_registry(registry);
    let controller = PipelineController::new(config, store, SystemHost);

    let token = controller.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("received interrupt, cancelling");
            token.cancel();
        }
    });

    match &args.subcommand {
        ImageVmSubcommand::Pull { .. } => {
            let resolved = controller.pull(image).await?;
            println!(
                "{} {}",
                "image".header(),
                resolved.get_reference().to_string().literal()
            );
            println!("{} {}", "manifest".header(), resolved.get_manifest_digest());
            println!(
                "{} {:?}",
                "command".header(),
                resolved.get_config().command_line()
            );
            for layer in resolved.get_layers() {
                println!(
                    "{} {} {} {}",
                    "layer".header(),
                    layer.get_index(),
                    layer.digest().to_string().literal(),
                    format!("{} bytes", layer.size()).placeholder()
                );
            }
        }
        ImageVmSubcommand::Build { .. } => {
            let rootfs = controller.build(image).await?;
            println!(
                "{} {}",
                "rootfs".header(),
                rootfs.get_path().display().to_string().literal()
            );
        }
        ImageVmSubcommand::Run { .. } => {
            let status = controller.run(image).await?;
            tracing::info!("vm exited with {status}");
        }
    }

    Ok(())
}
