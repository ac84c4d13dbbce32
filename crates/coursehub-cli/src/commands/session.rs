use anyhow::{Result, bail};
use coursehub_application::{LaunchRequest, SessionLaunchUseCase};
use coursehub_core::config::HubConfig;
use coursehub_core::identity::{IdentityReconciler, Role};
use coursehub_core::workspace::{MountPlanner, WorkspaceProvisioner};
use coursehub_infrastructure::{
    JsonSessionRecordRepository, LocalWorkspaceFs, MoodleRosterGateway,
    SwarmOrchestratorClient, TomlDirectoryService,
};
use std::sync::Arc;
use std::time::Duration;

/// Wires the production adapters into the use case.
fn build_usecase(config: &HubConfig) -> Result<SessionLaunchUseCase> {
    let directory = match &config.directory.store_path {
        Some(path) => TomlDirectoryService::new(path.clone()),
        None => TomlDirectoryService::default_location()?,
    };
    let records = match &config.runtime.records_dir {
        Some(path) => JsonSessionRecordRepository::new(path.clone()),
        None => JsonSessionRecordRepository::default_location()?,
    };

    let reconciler = Arc::new(IdentityReconciler::new(
        Arc::new(directory),
        config.accounts.clone(),
    ));
    let provisioner = Arc::new(WorkspaceProvisioner::new(
        Arc::new(LocalWorkspaceFs::new()),
        MountPlanner::new(config.workspace.clone()),
        config.accounts.clone(),
    ));

    let mut usecase = SessionLaunchUseCase::new(
        reconciler,
        provisioner,
        Arc::new(SwarmOrchestratorClient::connect_local()?),
        Arc::new(records),
        config.orchestrator.clone(),
        config.runtime.provisioning_workers,
    );
    if let Some(roster) = MoodleRosterGateway::from_settings(&config.roster)? {
        usecase = usecase.with_roster(Arc::new(roster));
    }
    Ok(usecase)
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub async fn launch(
    config: &HubConfig,
    user: String,
    role: Role,
    course: String,
    subject_id: Option<u32>,
    timeout: Option<u64>,
) -> Result<()> {
    let usecase = build_usecase(config)?;
    let request = LaunchRequest::new(user.clone(), role, course)
        .with_subject_id(subject_id)
        .with_timeout(timeout.map(Duration::from_secs));

    tokio::select! {
        result = usecase.launch(request) => print_json(&result?),
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!(username = %user, "Interrupted, tearing down the session");
            usecase.teardown(&user).await?;
            bail!("launch interrupted");
        }
    }
}

pub async fn teardown(config: &HubConfig, user: &str) -> Result<()> {
    let usecase = build_usecase(config)?;
    match usecase.teardown(user).await? {
        Some(record) => print_json(&record),
        None => {
            println!("No session known for '{}'", user);
            Ok(())
        }
    }
}

pub async fn status(config: &HubConfig, user: Option<&str>, check: bool) -> Result<()> {
    let usecase = build_usecase(config)?;
    let Some(user) = user else {
        return print_json(&usecase.list().await?);
    };

    let Some(record) = usecase.status(user).await? else {
        println!("No session known for '{}'", user);
        return Ok(());
    };
    print_json(&record)?;

    if check {
        match usecase.poll(user).await? {
            None => println!("health: ok"),
            Some(status) => println!("health: {}", status),
        }
    }
    Ok(())
}

pub async fn plan(
    config: &HubConfig,
    user: String,
    role: Role,
    course: String,
    subject_id: Option<u32>,
) -> Result<()> {
    let usecase = build_usecase(config)?;
    let request = LaunchRequest::new(user, role, course).with_subject_id(subject_id);
    print_json(&usecase.plan(&request).await?)
}
