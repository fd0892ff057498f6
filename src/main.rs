use anyhow::Context;

fn main() -> anyhow::Result<()> {
    agentfeed::run().context("agentfeed command failed")
}
