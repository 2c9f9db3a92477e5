use anyhow::Context;

fn main() -> anyhow::Result<()> {
    meshcat::run().context("meshcat failed")
}
