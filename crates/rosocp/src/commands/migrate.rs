//! Schema migration commands

use anyhow::Result;
use rosocp_lib::Settings;

pub async fn up(settings: &Settings) -> Result<()> {
    let store = super::connect(settings).await?;
    store.migrate().await?;
    println!("Database is up to date");
    Ok(())
}

pub async fn status(settings: &Settings) -> Result<()> {
    let store = super::connect(settings).await?;
    let migrations = store.migration_status().await?;

    let pending = migrations.iter().filter(|(_, _, applied)| !applied).count();
    for (version, description, applied) in &migrations {
        let state = if *applied { "applied" } else { "pending" };
        println!("{version:>16}  {state:<8}  {description}");
    }
    println!("{} migrations, {pending} pending", migrations.len());
    Ok(())
}
