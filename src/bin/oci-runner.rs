use anyhow::Context as _;

fn main() -> anyhow::Result<()> {
    let pipe_base = std::env::args()
        .nth(1)
        .context("usage: oci-runner <named_pipe_base>")?;
    oci::run_runner(&pipe_base)?;
    Ok(())
}
