pub const SAMPLE_EXPERIMENT: &str = r#"# LoopEval experiment file
name: capitals-smoke
space_id: 1
item_concurrency: 2

dataset:
  name: capitals
  fields: [input, reference_output]
  items:
    - input: France
      reference_output: Paris
      answer: Paris
    - input: Japan
      reference_output: Tokyo
      answer: Kyoto

# The code target answers from the dataset itself; swap in loop_prompt,
# coze_bot, coze_workflow or trace_callback to test a real system.
target:
  kind: code
  source_id: oracle
  config:
    outputs:
      actual_output: "{{answer}}"

evaluators:
  - name: exact
    template: exact_match
  - name: mentions-reference
    template: contains_reference

# Minimum average score per evaluator; a miss exits with code 1.
thresholds:
  exact: 0.5

# Prompt evaluators and prompt targets need a provider: fake | openai.
llm:
  provider: none
"#;
