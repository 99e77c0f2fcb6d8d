//! End-to-end iteration scenarios driven through `step`/`run` with scripted
//! model replies and a scripted sandbox.

use refiner::core::document::{ROOT_SECTION_ID, SectionContent};
use refiner::core::naming::NamingPolicy;
use refiner::core::recovery::RecoveryTier;
use refiner::core::store::DuplicatePolicy;
use refiner::core::toc::{TocOrdering, synthesize};
use refiner::io::config::RefinerConfig;
use refiner::io::model::ScriptedModel;
use refiner::io::sandbox::DisabledSandbox;
use refiner::io::session_store::{load_session, write_session};
use refiner::test_support::{ScriptedSandbox, Workspace};
use refiner::{StopReason, Task, create_task, run, step};

/// `Calculate 2+2`: plan, execute, complete. The execution's stdout is kept
/// in history and in an execution section parented to the focus.
#[test]
fn calculate_with_execution_completes() {
    let mut task = create_task("Calculate 2+2", RefinerConfig::default()).expect("task");
    let model = ScriptedModel::new([
        r#"<new_section name="Work">Add the two numbers.</new_section>
<set_focus id="Work"/>"#,
        "Let me compute it.\n<execute>\n    print(2+2)\n</execute>",
        "<complete>4</complete>",
    ]);
    let sandbox = ScriptedSandbox::new(["4\n"]);

    let outcome = run(&mut task, &model, &sandbox, 10, |_| {}).expect("run");

    assert_eq!(
        outcome.stop,
        StopReason::Completed {
            final_answer: "4".to_string()
        }
    );
    assert_eq!(outcome.history.len(), 3);
    assert_eq!(sandbox.codes(), vec!["print(2+2)".to_string()]);

    let execution_entry = outcome.history.get_at(2).expect("entry 2");
    assert_eq!(execution_entry.executions.len(), 1);
    assert_eq!(execution_entry.executions[0].stdout, "4\n");

    let state = &outcome.final_state;
    let exec = state.section("Execution_2_0").expect("execution section");
    assert!(matches!(exec.content, SectionContent::Execution(_)));
    assert_eq!(state.relations.parent_of("Execution_2_0"), Some("Work"));
    assert_eq!(
        state.section("Final_Answer").expect("answer").content.render(),
        "4"
    );
}

/// `Calculate 2+2` in one reply: the execution's output lands in the
/// `Result` section declared after it, and its stdout is kept in history.
#[test]
fn execution_output_lands_in_result_section() {
    let mut task = create_task("Calculate 2+2", RefinerConfig::default()).expect("task");
    let model = ScriptedModel::new([
        "<execute>print(2+2)</execute>\n<new_section name=\"Result\">The sum is:</new_section>",
    ]);
    let sandbox = ScriptedSandbox::new(["4\n"]);

    let outcome = step(&mut task, &model, &sandbox).expect("step");

    assert_eq!(outcome.entry.recovery.tier, RecoveryTier::Normal);
    assert_eq!(outcome.entry.executions.len(), 1);
    assert_eq!(outcome.entry.executions[0].stdout, "4\n");
    let result = outcome
        .state()
        .section("Result")
        .expect("result section")
        .content
        .render();
    assert!(result.starts_with("The sum is:"));
    assert!(result.contains('4'));
    assert_eq!(
        task.history().get_at(1).expect("entry 1").executions[0].stdout,
        "4\n"
    );
}

/// A reply with no directive triggers one corrective prompt; the valid
/// retry is committed as a single ledger entry with `attempts = 1`.
#[test]
fn missing_marker_is_corrected_once() {
    let mut task = create_task("Summarize the report", RefinerConfig::default()).expect("task");
    let model = ScriptedModel::new([
        "Sure! The report is about sales.",
        r#"<new_section name="Summary">Sales grew.</new_section>"#,
    ]);

    let outcome = step(&mut task, &model, &DisabledSandbox).expect("step");

    assert_eq!(outcome.entry.recovery.attempts, 1);
    assert_eq!(outcome.entry.recovery.tier, RecoveryTier::Correcting(1));
    assert_eq!(task.history().len(), 1);
    assert!(outcome.state().section("Summary").is_some());

    let prompts = model.prompts();
    assert_eq!(prompts.len(), 2);
    assert!(prompts[1].contains("missing_marker"));
    assert!(prompts[1].contains("Sure! The report is about sales."));
}

/// `Plan` and `plan` in one batch fold into one section under both
/// folding policies.
#[test]
fn normalized_duplicate_names_yield_one_section() {
    for (policy, expected) in [
        (DuplicatePolicy::Append, "first\nsecond"),
        (DuplicatePolicy::Replace, "second"),
    ] {
        let config = RefinerConfig {
            duplicate_sections: policy,
            section_naming_policy: NamingPolicy::CaseInsensitiveNormalize,
            ..RefinerConfig::default()
        };
        let mut task = create_task("x", config).expect("task");
        let model = ScriptedModel::new([
            r#"<new_section name="Plan">first</new_section><new_section name="plan">second</new_section>"#,
        ]);
        let outcome = step(&mut task, &model, &DisabledSandbox).expect("step");
        let plans: Vec<_> = outcome
            .state()
            .sections
            .values()
            .filter(|s| s.name.eq_ignore_ascii_case("plan"))
            .collect();
        assert_eq!(plans.len(), 1, "{policy:?}");
        assert_eq!(plans[0].content.render(), expected, "{policy:?}");
    }
}

/// Any reply, however broken, still produces exactly one new ledger entry.
#[test]
fn every_iteration_appends_exactly_one_entry() {
    let replies = [
        "",
        "<new_section name=\"Open\">never closed",
        "<frobnicate_section name=\"X\">?</frobnicate_section>",
        "<modify_section id=\"Missing\">x</modify_section>",
        "<complete>answer</complete><new_section name=\"Late\">x</new_section>",
    ];
    for reply in replies {
        let mut task = create_task("x", RefinerConfig::default()).expect("task");
        // The same reply for every tier forces the full escalation path.
        let model = ScriptedModel::new([reply; 4]);
        let outcome = step(&mut task, &model, &DisabledSandbox).expect("step");
        assert_eq!(task.history().len(), 1, "reply {reply:?}");
        assert_eq!(outcome.entry.iteration, 1);
        assert!(outcome.state().section(ROOT_SECTION_ID).is_some());
    }
}

/// A rejected batch leaves no trace of its valid prefix.
#[test]
fn rejected_batch_is_atomic() {
    let mut task = create_task("x", RefinerConfig::default()).expect("task");
    let model = ScriptedModel::new([
        r#"<new_section name="Kept">k</new_section>"#,
        r#"<new_section name="Ghost">g</new_section><set_focus id="Nowhere"/>"#,
        r#"<set_focus id="Kept"/>"#,
    ]);
    step(&mut task, &model, &DisabledSandbox).expect("first");
    let outcome = step(&mut task, &model, &DisabledSandbox).expect("second");
    assert!(outcome.state().section("Ghost").is_none());
    assert_eq!(outcome.state().current_focus_id.as_deref(), Some("Kept"));
    assert_eq!(outcome.entry.recovery.attempts, 1);
}

/// ToC synthesis is a pure function of the state.
#[test]
fn toc_is_idempotent_across_iterations() {
    let mut task = create_task("x", RefinerConfig::default()).expect("task");
    let model = ScriptedModel::new([
        r#"<new_section name="B">b</new_section><new_section name="A"></new_section>"#,
    ]);
    step(&mut task, &model, &DisabledSandbox).expect("step");
    let state = task.current_state();
    let first = synthesize(state, TocOrdering::CreationOrder);
    assert_eq!(first, synthesize(state, TocOrdering::CreationOrder));
    let ids: Vec<_> = first.iter().map(|e| e.section_id.as_str()).collect();
    assert_eq!(ids, vec!["User_Request", "B", "A"]);
    assert!(!first[2].has_content);
}

/// Sessions survive a write/load cycle and resume where they stopped.
#[test]
fn persisted_session_resumes() {
    let ws = Workspace::new().expect("workspace");
    let mut task = create_task("x", RefinerConfig::default()).expect("task");
    let model = ScriptedModel::new([
        r#"<new_section name="A">a</new_section>"#,
        r#"<append_section name="A">more</append_section>"#,
        "<complete>done</complete>",
    ]);
    let outcome = run(&mut task, &model, &DisabledSandbox, 2, |_| {}).expect("run");
    assert_eq!(outcome.stop, StopReason::MaxIterations);

    write_session(&ws.session_path(), &task.to_session()).expect("write");
    let session = load_session(&ws.session_path()).expect("load");
    assert_eq!(session.ledger, *task.history());

    let mut resumed = Task::from_session(session, RefinerConfig::default()).expect("resume");
    let outcome = run(&mut resumed, &model, &DisabledSandbox, 5, |_| {}).expect("run");
    assert_eq!(
        outcome.stop,
        StopReason::Completed {
            final_answer: "done".to_string()
        }
    );
    assert_eq!(outcome.history.len(), 3);
    assert_eq!(outcome.steps_executed, 1);
    assert_eq!(
        outcome.final_state.section("A").expect("a").content.render(),
        "a\nmore"
    );
}

/// Per-iteration artifacts include every prompt of a recovered iteration.
#[test]
fn iteration_artifacts_are_written() {
    let ws = Workspace::new().expect("workspace");
    let log_dir = ws.path().join("logs");
    let mut task = create_task("x", RefinerConfig::default())
        .expect("task")
        .with_log_dir(&log_dir);
    let model = ScriptedModel::new(["nothing", r#"<new_section name="A">a</new_section>"#]);
    step(&mut task, &model, &DisabledSandbox).expect("step");

    let dir = log_dir.join("1");
    for file in [
        "prompt.1.md",
        "response.1.txt",
        "prompt.2.md",
        "response.2.txt",
        "meta.json",
        "state.before.json",
        "state.after.json",
    ] {
        assert!(dir.join(file).is_file(), "missing {file}");
    }
}
