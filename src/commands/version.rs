pub fn run() -> anyhow::Result<()> {
    println!("store-operator v{}", env!("CARGO_PKG_VERSION"));
    Ok(())
}
