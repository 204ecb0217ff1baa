// src/actions/custom_command.rs

//! Custom-command and dummy actions

use crate::actions::context::{ConfigAccess, RequiredDatabases, RequiredParameters};
use crate::actions::process::BuildProcessSession;
use crate::actions::{settings, ActionContext};
use crate::error::Error;

/// Run an arbitrary Bash command in the action's working directory
///
/// The command comes from the "cmd" setting; its output is tailed into
/// `the.log` below `<custom commands dir>/<directory>/`.
pub async fn run(context: &ActionContext) {
    if context
        .init(
            ConfigAccess::ReadConfig,
            RequiredDatabases::default(),
            RequiredParameters::None,
        )
        .is_none()
    {
        return;
    }
    let directory = context.snapshot(|action| action.directory.clone());
    if directory.is_empty() {
        context.report_error("No directory specified.");
        return;
    }
    let command = context
        .snapshot(|action| action.setting(settings::COMMAND).map(str::to_string))
        .unwrap_or_default();
    if command.is_empty() {
        context.report_error("No command specified.");
        return;
    }

    let working_directory = {
        let building = context
            .setup
            .building
            .read()
            .expect("building lock poisoned");
        building.custom_commands_dir().join(&directory)
    };
    if let Err(e) = std::fs::create_dir_all(&working_directory) {
        context.report_error(format!("Unable to create working directory: {e}"));
        return;
    }

    context.log_info(format!("Running custom command: {command}"));
    context.with_action_mut(|action| action.register_log_file("command"));

    let session = BuildProcessSession::new(
        "command",
        working_directory.join("the.log"),
        context.abort.clone(),
    )
    .with_working_dir(&working_directory);
    match session
        .run("bash", &["-ec".to_string(), command], None)
        .await
    {
        Err(Error::Aborted) => {
            context.report_aborted_if_aborted();
        }
        Err(e) => context.report_error(e.to_string()),
        Ok(result) if !result.error.is_empty() => {
            context.log_info(format!("Unable to invoke command: {}", result.error));
            context.report_error(result.error);
        }
        Ok(result) => {
            let exit_code = result.exit_code.unwrap_or(-1);
            context.log_info(format!("Command exited with return code {exit_code}"));
            if exit_code != 0 {
                context.report_error(format!("non-zero exit code {exit_code}"));
            } else {
                context.report_success();
            }
        }
    }
}

/// No-op action for debugging the engine; logs a heartbeat and honors abort
pub async fn run_dummy(context: &ActionContext) {
    context.log_info("Running dummy build action");
    for _ in 0..5 {
        if context.report_aborted_if_aborted() {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    context.log_info("Dummy build action finished");
    context.report_success();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::engine::ActionManager;
    use crate::actions::{
        BuildAction, BuildActionResult, BuildActionResultData, BuildActionType,
    };
    use crate::setup::ServiceSetup;
    use std::sync::Arc;

    async fn run_custom_command(
        setup: &Arc<ServiceSetup>,
        directory: &str,
        command: &str,
    ) -> BuildAction {
        let mut draft = BuildAction::default();
        draft.action_type = BuildActionType::CustomCommand;
        draft.directory = directory.to_string();
        if !command.is_empty() {
            draft
                .settings
                .insert(settings::COMMAND.to_string(), command.to_string());
        }
        let action = ActionManager::create(setup, draft);
        let context = ActionContext::new(Arc::clone(setup), Arc::clone(&action));
        run(&context).await;
        let result = action.read().unwrap().clone();
        result
    }

    fn test_setup() -> (tempfile::TempDir, Arc<ServiceSetup>) {
        let dir = tempfile::tempdir().unwrap();
        let setup = ServiceSetup::default();
        setup.building.write().unwrap().working_directory = dir.path().join("building");
        (dir, Arc::new(setup))
    }

    #[tokio::test]
    async fn test_missing_directory_fails() {
        let (_dir, setup) = test_setup();
        let action = run_custom_command(&setup, "", "echo hi").await;
        assert_eq!(action.result, BuildActionResult::Failure);
        assert_eq!(
            action.result_data,
            BuildActionResultData::Error("No directory specified.".to_string())
        );
    }

    #[tokio::test]
    async fn test_missing_command_fails() {
        let (_dir, setup) = test_setup();
        let action = run_custom_command(&setup, "cmd-test", "").await;
        assert_eq!(action.result, BuildActionResult::Failure);
        assert_eq!(
            action.result_data,
            BuildActionResultData::Error("No command specified.".to_string())
        );
    }

    #[tokio::test]
    async fn test_successful_command_writes_log() {
        let (_dir, setup) = test_setup();
        let action = run_custom_command(&setup, "cmd-test", "echo hi").await;
        assert_eq!(action.result, BuildActionResult::Success);

        let log_path = {
            let building = setup.building.read().unwrap();
            building.custom_commands_dir().join("cmd-test/the.log")
        };
        let content = std::fs::read_to_string(log_path).unwrap();
        assert_eq!(content, "hi\n");
        assert!(action.log_files.contains(&"command".to_string()));
    }

    #[tokio::test]
    async fn test_failing_command_reports_exit_code() {
        let (_dir, setup) = test_setup();
        let action = run_custom_command(&setup, "cmd-test", "exit 3").await;
        assert_eq!(action.result, BuildActionResult::Failure);
        assert_eq!(
            action.result_data,
            BuildActionResultData::Error("non-zero exit code 3".to_string())
        );
    }
}
