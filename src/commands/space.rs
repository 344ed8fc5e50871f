use std::io::{BufWriter, Write};

use anyhow::{Context, Result, bail};
use tracing::info;

use crate::cli::SpaceArgs;
use crate::model::BoundsOverride;
use crate::space::{ParameterSpace, SystemSpace};
use crate::util::read_json;

pub fn run(args: SpaceArgs) -> Result<()> {
    let space = ParameterSpace::builtin();
    let bounds_override = args
        .bounds_path
        .as_deref()
        .map(read_json::<BoundsOverride>)
        .transpose()?;

    let systems: Vec<SystemSpace> = match args.system.as_deref() {
        Some(system) => vec![space.resolve(system, bounds_override.as_ref())?],
        None => {
            if bounds_override.is_some() {
                bail!("--bounds-path requires --system");
            }
            space
                .system_ids()
                .into_iter()
                .map(|system| space.resolve(system, None))
                .collect::<Result<Vec<SystemSpace>, _>>()?
        }
    };

    info!(
        systems = systems.len(),
        narrowed = bounds_override.is_some(),
        "printing parameter space"
    );

    let stdout = std::io::stdout();
    let mut out = BufWriter::new(stdout.lock());
    serde_json::to_writer_pretty(&mut out, &systems).context("failed to write parameter space")?;
    writeln!(out).context("failed to write parameter space")?;
    out.flush().context("failed to flush stdout")?;
    Ok(())
}
