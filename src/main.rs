use anyhow::Context;

fn main() -> anyhow::Result<()> {
    mailroom::run().context("mailroom command failed")
}
