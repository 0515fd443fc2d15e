//! Starter configuration documents written by `ashep init`.

pub const CONFIG_YAML: &str = r#"# ashep engine configuration
version: 1

worker:
  poll_interval_ms: 5000
  max_concurrent_runs: 2

monitor:
  poll_interval_ms: 10000
  stall_threshold_ms: 120000
  timeout_multiplier: 1.5

ui:
  port: 8787
  host: 127.0.0.1

# Used when no registered agent covers a required capability.
fallback:
  enabled: false
  # default_agent: generalist
  # mappings:
  #   review: reviewer

workflow:
  # error | warning | ignore
  invalid_label_strategy: error

hitl:
  allowed_reasons:
    predefined:
      - approval
      - max-retries-exceeded
      - loop-detected
      - no-capable-agent
      - assistant-block
    allow_custom: true
    custom_validation: alphanumeric-dash-underscore

worker_assistant:
  enabled: false
  agentCapability: worker-assistant
  timeoutMs: 60000
  fallbackAction: block

loop_prevention:
  enabled: true
  max_visits_default: 5
  max_transitions_default: 3
  cycle_detection_length: 6

session_continuation:
  default_max_context_tokens: 130000
  default_threshold: 0.8

cleanup:
  enabled: true
  run_on_startup: false
  schedule_interval_hours: 24

retention:
  enabled: true
  policies:
    - name: default
      age_days: 30
      max_runs: 10000
      max_size_mb: 500
      archive_enabled: true
      archive_after_days: 7
      delete_after_days: 30
      keep_successful_runs: false
      keep_failed_runs: true

tracker:
  bin: bd

agent:
  bin: opencode
"#;

pub const POLICIES_YAML: &str = r#"# Workflow policies
default_policy: simple

policies:
  simple:
    description: Implement, test, validate
    timeout_base_ms: 600000
    retry:
      max_attempts: 2
      strategy: exponential
      initial_delay_ms: 1000
      max_delay_ms: 60000
    phases:
      - name: implement
        description: Implement the change
        capabilities: [code]
      - name: test
        description: Run and fix the tests
        capabilities: [test]
        reuse_session_from_phase: "@previous"
      - name: validate
        description: Final review
        capabilities: [review]
        timeout_multiplier: 0.5
"#;

pub const AGENTS_YAML: &str = r#"# Agent catalogue
agents:
  - id: build
    name: Build Agent
    capabilities: [code, test, review]
    priority: 10
"#;
