// kiln/src/cli/install.rs
use clap::Args;
use kiln_common::config::Config;
use kiln_common::error::{KilnError, Result};
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::pipeline::{self, PipelineFlags};

#[derive(Debug, Args)]
pub struct InstallArgs {
    /// Number of formulae allowed to build at the same time
    #[arg(long, short = 'j', value_name = "N")]
    jobs: Option<usize>,

    /// Keep the build workspaces under <root>/tmp for inspection
    #[arg(long)]
    keep_tmp: bool,

    /// Also build the test dependencies of the requested formula
    #[arg(long)]
    include_test: bool,

    /// Formula to install
    name: String,

    /// Formula options, e.g. --with-clang --without-python --enable-targets=all.
    /// Everything after the formula name is passed to the formula.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, value_name = "OPTIONS")]
    options: Vec<String>,
}

impl InstallArgs {
    #[instrument(skip(self, config, cancel), fields(target = %self.name))]
    pub async fn run(&self, config: &Config, cancel: CancellationToken) -> Result<()> {
        let mut config = config.clone();
        if let Some(jobs) = self.jobs {
            if jobs == 0 {
                return Err(KilnError::Generic("--jobs must be at least 1".to_string()));
            }
            config.jobs = jobs;
        }
        config.keep_tmp |= self.keep_tmp;

        let flags = PipelineFlags {
            include_test: self.include_test,
        };
        pipeline::run_pipeline(&self.name, &self.options, &config, &flags, cancel).await
    }
}
