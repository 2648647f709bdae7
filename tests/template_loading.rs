use std::collections::HashMap;
use std::sync::Arc;

use serde_json::json;

use conductor::{
    init_tracing, Collaborators, ConductorError, Successors, TemplateRegistry, ValidationError,
    WorkflowEngine,
};
use conductor_test_utils::fixtures::{BROKEN_JSON, DIAMOND_JSON, FETCH_LOOP_JSON};
use conductor_test_utils::ScriptedAgent;

#[test]
fn test_load_dir_registers_every_template() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("b_fetch.json"), FETCH_LOOP_JSON).unwrap();
    std::fs::write(dir.path().join("a_diamond.json"), DIAMOND_JSON).unwrap();
    std::fs::write(dir.path().join("notes.txt"), "not a template").unwrap();

    let mut registry = TemplateRegistry::new();
    let loaded = registry.load_dir(dir.path()).unwrap();

    assert_eq!(loaded, vec!["diamond", "fetch-loop"]);
    assert_eq!(registry.names(), vec!["diamond", "fetch-loop"]);
}

#[test]
fn test_compiled_diamond_shape() {
    let mut registry = TemplateRegistry::new();
    registry.load_json_str(DIAMOND_JSON).unwrap();
    let workflow = registry.get("diamond").unwrap();

    assert_eq!(workflow.entry_steps(), ["research".to_string()]);
    match workflow.successors("research") {
        Successors::FanOut(next) => assert_eq!(next, &vec!["outline", "examples"]),
        other => panic!("expected fan-out, got {other:?}"),
    }
    assert_eq!(
        workflow.execution_layers(),
        vec![
            vec!["research".to_string()],
            vec!["outline".to_string(), "examples".to_string()],
            vec!["review".to_string()],
        ]
    );
}

#[test]
fn test_invalid_template_reports_every_finding() {
    let mut registry = TemplateRegistry::new();
    let err = registry.load_json_str(BROKEN_JSON).unwrap_err();

    match err {
        ConductorError::InvalidTemplate { template, errors } => {
            assert_eq!(template, "broken");
            assert!(errors.contains(&ValidationError::UnknownDependency {
                step: "a".into(),
                dependency: "ghost".into(),
            }));
            assert!(errors.contains(&ValidationError::MissingToolName("b".into())));
        }
        other => panic!("expected InvalidTemplate, got {other}"),
    }
    assert!(registry.is_empty());
}

#[test]
fn test_malformed_json_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bad.json");
    std::fs::write(&path, "{ not json").unwrap();

    let err = TemplateRegistry::new().load_file(&path).unwrap_err();
    assert!(matches!(err, ConductorError::Json(_)));
}

#[tokio::test]
async fn test_loaded_template_runs_end_to_end() {
    init_tracing(Some("warn"));
    let mut registry = TemplateRegistry::new();
    registry.load_json_str(FETCH_LOOP_JSON).unwrap();

    let agent = Arc::new(
        ScriptedAgent::new()
            .reply("fetch", &["items: 0", "items: 7"])
            .reply("check", &[r#"{"ok": false}"#, r#"{"ok": true}"#]),
    );
    let engine = WorkflowEngine::new(
        Arc::new(registry),
        Collaborators::new().with_agent(agent.clone()),
    );

    let params = HashMap::from([("source".to_string(), json!("file:///feed.xml"))]);
    let result = engine.run("fetch-loop", params).await.unwrap();

    assert!(result.success, "run failed: {:?}", result.error);
    assert_eq!(result.output.as_deref(), Some("done with items: 7"));
    assert_eq!(agent.calls()[0].instruction, "fetch file:///feed.xml");
}
