//! Sample out-of-process plugin built on `metashell-plugin-sdk`. Accepts
//! command reports and exposes one metacommand, `last`, that replays the
//! most recently reported command as a shell injection.

use core_protocol::{MetacommandInfo, MetacommandResponse, ResponseFormat};
use metashell_plugin_sdk::{run, Plugin};

struct ExampleLogger {
    last_command: Option<String>,
}

impl Plugin for ExampleLogger {
    fn name(&self) -> &str {
        "example-logger"
    }

    fn version(&self) -> &str {
        env!("CARGO_PKG_VERSION")
    }

    fn accepts_command_reports(&self) -> bool {
        true
    }

    fn metacommands(&self) -> Vec<MetacommandInfo> {
        vec![MetacommandInfo {
            name: "last".to_string(),
            format: ResponseFormat::ShellInjection,
        }]
    }

    fn report_command(&mut self, command: &str, tty: &str, timestamp: i64, exit_code: i32) {
        tracing::info!(target: "example_logger", tty, timestamp, exit_code, command, "command reported");
        self.last_command = Some(command.to_string());
    }

    fn metacommand(&mut self, name: &str, _args: Vec<String>) -> Result<MetacommandResponse, String> {
        match name {
            "last" => match &self.last_command {
                Some(command) => Ok(MetacommandResponse {
                    data: command.clone().into_bytes(),
                    error: None,
                }),
                None => Err("no command has been reported yet".to_string()),
            },
            other => Err(format!("unknown metacommand `{other}`")),
        }
    }
}

fn main() -> anyhow::Result<()> {
    run(ExampleLogger { last_command: None })
}
