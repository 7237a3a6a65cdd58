use std::{env, process::exit};
use vessel::Cli;

/// The binary is CLI, container init, exec helper and detached shim in
/// one; sentinels in the environment select the role before any runtime
/// or argument parsing starts.
fn main() {
    if env::var_os(vessel::container::init::ENV_INIT).is_some() {
        exit(vessel::container::init::run());
    }
    if env::var_os(vessel::container::exec::ENV_EXEC_PID).is_some() {
        exit(vessel::container::exec::run());
    }
    if let Some(dir) = env::var_os(vessel::container::init::ENV_SHIM_DIR) {
        exit(run_shim(dir.into()));
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("build tokio runtime");
    let code = runtime.block_on(Cli::from_args().dispatch());
    exit(code);
}

/// Supervisor for detached containers: executes the already created
/// container to completion, disconnected from the invoking terminal.
fn run_shim(container_dir: std::path::PathBuf) -> i32 {
    use clap::Parser;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("build tokio runtime");

    runtime.block_on(async move {
        let config = vessel::Config::try_parse_from(["vessel"]).expect("config from environment");
        let result = async {
            let runner = vessel::container::runner::Runner::new(config)?;
            let container = runner
                .store()
                .config(
                    &container_dir
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_default(),
                )?;
            runner.execute(&container, false).await
        }
        .await;

        match result {
            Ok(code) => code,
            Err(e) => {
                log::error!("Detached container failed: {:#}", e);
                1
            }
        }
    })
}
