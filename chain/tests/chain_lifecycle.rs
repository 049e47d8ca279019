//! Attempt-level lifecycle tests for the decision loop.
//!
//! These drive `ChainSearch::start` with a scripted model and an in-memory
//! environment to verify end-to-end behavior: chain shape in both action
//! modes, pruning on give-up and depth exhaustion, hallucinated-name
//! rewriting, attempt retries and the exported run-result document.

use chain::core::status::HALLUCINATED_NAME_SENTINEL;
use chain::core::types::{ActionCall, ActionMode, NodeType, Role};
use chain::export::{RunResult, schema_violations};
use chain::io::config::SearchConfig;
use chain::io::environment::Environment;
use chain::search::{ChainSearch, Task};
use chain::test_support::{
    ScriptedModel, ToyEnvironment, code_reply, json_reply, thought_reply,
};

const ANSWER: &str = r#"{"return_type": "give_answer", "final_answer": "42"}"#;
const GIVE_UP: &str = r#"{"return_type": "give_up_and_restart"}"#;

fn toy_env() -> ToyEnvironment {
    ToyEnvironment::new().with_tool("search", "x is 42", 0)
}

fn task(env: &ToyEnvironment) -> Task {
    Task {
        tools: env.declarations(),
        task_description: "You answer trivia questions with the tools provided.".to_string(),
        input_description: "What is x?".to_string(),
    }
}

fn config(mode: ActionMode, max_steps: usize, pass_at: usize) -> SearchConfig {
    SearchConfig {
        max_steps,
        pass_at,
        action_mode: mode,
        ..SearchConfig::default()
    }
}

fn node_types(chain: &[chain::export::NodeRecord]) -> Vec<NodeType> {
    chain.iter().map(|n| n.node_type).collect()
}

/// Search then answer in JSON mode.
///
/// Expected chain:
/// ```text
/// Thought → Action(search) → Action Input → Thought → Action(Finish) → Action Input (terminal)
/// ```
#[test]
fn json_mode_search_then_finish_wins() {
    let env = toy_env();
    let model = ScriptedModel::new(vec![
        json_reply("I should look x up.", "search", r#"{"query": "x"}"#),
        json_reply("I know the answer.", "Finish", ANSWER),
    ]);
    let cfg = config(ActionMode::JsonAsAction, 12, 1);
    let mut search = ChainSearch::new(&model, env.clone(), task(&env), &cfg).expect("search");

    let won = search.start(12, 1, 1).expect("start");
    assert!(won);
    assert_eq!(search.status(), 1);
    assert_eq!(search.query_count(), 2);
    assert_eq!(search.total_tokens(), 10);

    let single = search.to_json_single().expect("one try");
    assert!(single.win);
    assert_eq!(
        node_types(&single.chain),
        vec![
            NodeType::Thought,
            NodeType::Action,
            NodeType::ActionInput,
            NodeType::Thought,
            NodeType::Action,
            NodeType::ActionInput,
        ]
    );
    let first_input = &single.chain[2];
    assert_eq!(first_input.description, r#"{"query": "x"}"#);
    assert_eq!(first_input.observation.as_deref(), Some("x is 42"));
    assert_eq!(first_input.observation_code, Some(0));
    assert!(!first_input.is_terminal);

    let last = single.chain.last().expect("last node");
    assert!(last.is_terminal);
    assert!(!last.pruned);
    assert_eq!(last.depth, 6);
    assert_eq!(last.child_count, 0);

    // The observation reaches the model as a function turn.
    let second_call = &model.seen()[1];
    let observation = second_call.last().expect("observation message");
    assert_eq!(observation.role, Role::Function);
    assert_eq!(observation.name.as_deref(), Some("search"));
    assert_eq!(observation.content.as_deref(), Some("x is 42"));
}

#[test]
fn code_mode_search_then_finish_wins() {
    let env = toy_env();
    let model = ScriptedModel::new(vec![
        code_reply("Look it up.", r#"search(query="x")"#),
        code_reply(
            "Answer.",
            r#"Finish(return_type="give_answer", final_answer="42")"#,
        ),
    ]);
    let cfg = config(ActionMode::CodeAsAction, 12, 1);
    let mut search = ChainSearch::new(&model, env.clone(), task(&env), &cfg).expect("search");

    assert!(search.start(12, 1, 1).expect("start"));
    let single = search.to_json_single().expect("one try");
    assert_eq!(
        node_types(&single.chain),
        vec![
            NodeType::Thought,
            NodeType::CodeAction,
            NodeType::Thought,
            NodeType::CodeAction,
        ]
    );
    assert_eq!(single.chain[1].observation.as_deref(), Some("x is 42"));
    assert!(single.chain[3].is_terminal);

    let second_call = &model.seen()[1];
    let observation = second_call.last().expect("observation message");
    assert_eq!(observation.role, Role::User);
    assert_eq!(observation.content.as_deref(), Some("Observation: x is 42"));
}

#[test]
fn single_successful_search_solves_the_task() {
    let env = toy_env().solved_by("search");
    let model = ScriptedModel::new(vec![json_reply("ok", "search", r#"{"query": "x"}"#)]);
    let cfg = config(ActionMode::JsonAsAction, 12, 1);
    let mut search = ChainSearch::new(&model, env.clone(), task(&env), &cfg).expect("search");

    let (tree, out) = search.run_attempt(12).expect("attempt");
    let terminal = tree.node(out);
    assert!(terminal.is_terminal);
    assert_eq!(terminal.node_type, NodeType::ActionInput);
    assert_eq!(terminal.observation, "x is 42");
    assert_eq!(terminal.observation_code, Some(0));
    // The snapshot the Thought node holds was never stepped.
    let thought = tree.node(tree.path_to(out)[1]);
    assert!(!thought.io_state.check_success());
    assert!(thought.io_state.calls().is_empty());

    let mut search = ChainSearch::new(&model, env.clone(), task(&env), &cfg).expect("search");
    assert!(search.start(12, 1, 1).expect("start"));
    assert_eq!(search.status(), 1);
    assert_eq!(
        node_types(&search.to_json_single().expect("one try").chain),
        vec![NodeType::Thought, NodeType::Action, NodeType::ActionInput]
    );
}

#[test]
fn code_mode_single_search_solves_the_task() {
    let env = toy_env().solved_by("search");
    let model = ScriptedModel::new(vec![code_reply("ok", r#"search(query="x")"#)]);
    let cfg = config(ActionMode::CodeAsAction, 12, 1);
    let mut search = ChainSearch::new(&model, env.clone(), task(&env), &cfg).expect("search");

    assert!(search.start(12, 1, 1).expect("start"));
    let chain = &search.to_json_single().expect("one try").chain;
    assert_eq!(node_types(chain), vec![NodeType::Thought, NodeType::CodeAction]);
    assert_eq!(chain[1].observation.as_deref(), Some("x is 42"));
    assert_eq!(chain[1].observation_code, Some(0));
    assert!(chain[1].is_terminal);
}

#[test]
fn give_up_scriptlet_prunes_the_attempt() {
    let env = toy_env().with_tool("give_up_and_restart", "restarting", 4);
    let model = ScriptedModel::new(vec![code_reply("I am stuck.", "give_up_and_restart()")]);
    let cfg = config(ActionMode::CodeAsAction, 12, 1);
    let mut search = ChainSearch::new(&model, env.clone(), task(&env), &cfg).expect("search");

    assert!(!search.start(12, 1, 1).expect("start"));
    assert_eq!(search.status(), 0);
    let single = search.to_json_single().expect("one try");
    assert!(!single.win);
    let last = single.chain.last().expect("last node");
    assert_eq!(last.node_type, NodeType::CodeAction);
    assert!(last.pruned);
    assert_eq!(last.observation_code, Some(4));
}

#[test]
fn give_up_prunes_and_loses() {
    let env = toy_env();
    let model = ScriptedModel::new(vec![json_reply("This is hopeless.", "Finish", GIVE_UP)]);
    let cfg = config(ActionMode::JsonAsAction, 12, 1);
    let mut search = ChainSearch::new(&model, env.clone(), task(&env), &cfg).expect("search");

    assert!(!search.start(12, 1, 1).expect("start"));
    assert_eq!(search.status(), 0);

    let single = search.to_json_single().expect("one try");
    let last = single.chain.last().expect("last node");
    assert_eq!(last.node_type, NodeType::ActionInput);
    assert!(last.pruned);
    assert_eq!(last.observation_code, Some(4));
    assert!(search.terminals()[0].pruned);

    let result = search.to_result(true, true);
    let generation = result.answer_generation.expect("answer generation");
    assert!(!generation.valid_data);
    assert!(generation.final_answer.is_empty());
    assert!(result.process.expect("process").compare_candidates.is_empty());
}

#[test]
fn depth_guard_prunes_at_exactly_max_steps() {
    for max_steps in [1, 2, 5] {
        let env = toy_env();
        let model = ScriptedModel::new(vec![thought_reply("Still thinking.")]);
        let cfg = config(ActionMode::JsonAsAction, max_steps, 1);
        let mut search = ChainSearch::new(&model, env.clone(), task(&env), &cfg).expect("search");

        assert!(!search.start(max_steps, 1, 1).expect("start"));
        let chain = &search.to_json_single().expect("one try").chain;
        assert_eq!(chain.len(), max_steps);
        let last = chain.last().expect("last node");
        assert_eq!(last.depth, max_steps);
        assert!(last.pruned);
        assert!(chain[..max_steps - 1].iter().all(|n| !n.pruned));
    }
}

#[test]
fn repeated_tool_calls_stop_at_depth_limit() {
    let env = toy_env();
    let model = ScriptedModel::new(vec![json_reply("Again.", "search", r#"{"query": "x"}"#)]);
    let cfg = config(ActionMode::JsonAsAction, 4, 1);
    let mut search = ChainSearch::new(&model, env.clone(), task(&env), &cfg).expect("search");

    search.start(4, 1, 1).expect("start");
    let chain = &search.to_json_single().expect("one try").chain;
    assert_eq!(chain.len(), 4);
    assert_eq!(chain[3].node_type, NodeType::Thought);
    assert!(chain[3].pruned);
}

#[test]
fn hallucinated_name_is_rewritten_in_history() {
    let env = toy_env();
    let model = ScriptedModel::new(vec![
        json_reply("Use the lookup tool.", "lookup", r#"{"query": "x"}"#),
        json_reply("Answer anyway.", "Finish", ANSWER),
    ]);
    let cfg = config(ActionMode::JsonAsAction, 12, 1);
    let mut search = ChainSearch::new(&model, env.clone(), task(&env), &cfg).expect("search");

    assert!(search.start(12, 1, 1).expect("start"));
    let single = search.to_json_single().expect("one try");
    // The node keeps what the model said; the history carries the sentinel.
    assert_eq!(single.chain[1].description, "lookup");
    assert_eq!(single.chain[2].observation_code, Some(1));

    let history = &model.seen()[1];
    let assistant = history
        .iter()
        .rev()
        .find(|m| m.role == Role::Assistant)
        .expect("assistant turn");
    match assistant.function_call.as_ref().expect("action") {
        ActionCall::JsonAsAction { name, .. } => assert_eq!(name, HALLUCINATED_NAME_SENTINEL),
        other => panic!("unexpected action {other:?}"),
    }
    let observation = history.last().expect("observation");
    assert_eq!(observation.name.as_deref(), Some(HALLUCINATED_NAME_SENTINEL));
}

#[test]
fn model_failure_ends_only_the_current_attempt() {
    let env = toy_env();
    let model = ScriptedModel::new(Vec::new())
        .then_error("connection reset")
        .then(json_reply("Answer.", "Finish", ANSWER));
    let cfg = config(ActionMode::JsonAsAction, 12, 2);
    let mut search = ChainSearch::new(&model, env.clone(), task(&env), &cfg).expect("search");

    assert!(search.start(12, 2, 1).expect("start"));
    let tries = search.tries();
    assert_eq!(tries.len(), 2);
    assert!(!tries[0].win);
    assert!(tries[0].chain.is_empty());
    assert!(tries[1].win);
    assert_eq!(search.query_count(), 1);
}

#[test]
fn stops_once_enough_attempts_succeed() {
    let env = toy_env();
    let model = ScriptedModel::new(vec![json_reply("Answer.", "Finish", ANSWER)]);
    let cfg = config(ActionMode::JsonAsAction, 12, 3);

    let mut search = ChainSearch::new(&model, env.clone(), task(&env), &cfg).expect("search");
    assert!(search.start(12, 3, 1).expect("start"));
    assert_eq!(search.tries().len(), 1);

    let mut search = ChainSearch::new(&model, env.clone(), task(&env), &cfg).expect("search");
    assert!(search.start(12, 3, 2).expect("start"));
    assert_eq!(search.tries().len(), 2);
    assert_eq!(search.success_count(), 2);
}

#[test]
fn attempts_start_from_fresh_environment() {
    let env = toy_env();
    let model = ScriptedModel::new(vec![
        json_reply("Look.", "search", r#"{"query": "x"}"#),
        json_reply("Quit.", "Finish", GIVE_UP),
        json_reply("Answer.", "Finish", ANSWER),
    ]);
    let cfg = config(ActionMode::JsonAsAction, 12, 2);
    let mut search = ChainSearch::new(&model, env.clone(), task(&env), &cfg).expect("search");

    assert!(search.start(12, 2, 1).expect("start"));
    let second = &search.tries()[1].chain;
    let last = second.last().expect("last node");
    assert_eq!(
        last.io_state,
        Some(serde_json::json!({"calls": 1, "solved": true}))
    );
}

#[test]
fn run_result_document_is_stable_and_schema_valid() {
    let env = toy_env();
    let model = ScriptedModel::new(vec![
        json_reply("Look.", "search", r#"{"query": "x"}"#),
        json_reply("Answer.", "Finish", ANSWER),
    ]);
    let cfg = config(ActionMode::JsonAsAction, 12, 1);
    let mut search = ChainSearch::new(&model, env.clone(), task(&env), &cfg).expect("search");
    search.start(12, 1, 1).expect("start");

    let result = search.to_result(true, true);
    let json = result.to_json_pretty().expect("serialize");
    assert_eq!(json, search.to_result(true, true).to_json_pretty().expect("again"));

    let parsed: RunResult = serde_json::from_str(&json).expect("parse");
    assert_eq!(parsed, result);
    assert_eq!(parsed.to_json_pretty().expect("reserialize"), json);

    let document: serde_json::Value = serde_json::from_str(&json).expect("value");
    assert_eq!(schema_violations(&document).expect("check"), Vec::<String>::new());

    let generation = result.answer_generation.expect("answer generation");
    assert!(generation.valid_data);
    assert_eq!(generation.final_answer, ANSWER);
    assert_eq!(generation.query_count, 2);
    assert_eq!(generation.chain.len(), 6);
    let last_turn = generation.train_messages.last().expect("train messages");
    assert_eq!(last_turn.role, Role::Function);

    let process = result.process.expect("process");
    assert!(process.win);
    assert_eq!(process.try_count, 1);
    assert_eq!(process.compare_candidates.len(), 1);
    assert_eq!(process.forward_args.single_chain_max_step, 12);
}

#[test]
fn answer_only_document_omits_process_fields() {
    let env = toy_env();
    let model = ScriptedModel::new(vec![json_reply("Answer.", "Finish", ANSWER)]);
    let cfg = config(ActionMode::JsonAsAction, 12, 1);
    let mut search = ChainSearch::new(&model, env.clone(), task(&env), &cfg).expect("search");
    search.start(12, 1, 1).expect("start");

    let document = serde_json::to_value(search.to_result(true, false)).expect("to value");
    let keys: Vec<&str> = document
        .as_object()
        .expect("object")
        .keys()
        .map(String::as_str)
        .collect();
    assert_eq!(keys, vec!["answer_generation"]);
    assert!(schema_violations(&document).expect("check").is_empty());
}

#[test]
fn every_attempt_tree_satisfies_invariants() {
    let env = toy_env();
    let model = ScriptedModel::new(vec![
        thought_reply("Hmm."),
        json_reply("Look.", "search", r#"{"query": "x"}"#),
        code_reply("Try code.", "r = search('x')\nprint(r)"),
        json_reply("Answer.", "Finish", ANSWER),
    ]);
    let cfg = config(ActionMode::JsonAsAction, 12, 1);
    let mut search = ChainSearch::new(&model, env.clone(), task(&env), &cfg).expect("search");

    let (tree, out) = search.run_attempt(12).expect("attempt");
    assert!(tree.validate().is_empty(), "{:?}", tree.validate());
    assert!(tree.node(out).is_terminal);
    let path = tree.path_to(out);
    assert_eq!(path.len(), tree.node(out).depth() + 1);
    for id in &path[1..] {
        let node = tree.node(*id);
        let parent = tree.node(node.father().expect("father"));
        assert_eq!(node.depth(), parent.depth() + 1);
        assert!(node.messages.starts_with(&parent.messages));
    }
}
