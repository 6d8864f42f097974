//! The standard four-phase development pipeline.

use crate::config::WorkflowConfig;
use crate::core::{ArtifactType, Task};
use crate::error::Result;

use super::engine::WorkflowEngine;
use super::types::{Phase, ReviewGate};

struct PhaseTemplate {
    name: &'static str,
    agent: &'static str,
    skills: &'static [(&'static str, &'static str)],
    gate: (&'static str, ArtifactType),
    min_review_rounds: Option<u32>,
    requires_tests_pass: bool,
}

const PIPELINE: &[PhaseTemplate] = &[
    PhaseTemplate {
        name: "requirements",
        agent: "product_manager",
        skills: &[
            ("requirement_analysis", "Analyze raw requirements"),
            ("user_story_writing", "Write user stories"),
            ("product_design", "Produce the PRD"),
        ],
        gate: ("product_review", ArtifactType::Prd),
        min_review_rounds: None,
        requires_tests_pass: false,
    },
    PhaseTemplate {
        name: "design",
        agent: "architect",
        skills: &[
            ("system_design", "Design the system architecture"),
            ("api_design", "Define API contracts"),
            ("tech_stack_selection", "Select the technology stack"),
        ],
        gate: ("architecture_review", ArtifactType::ArchitectureDesign),
        min_review_rounds: Some(3),
        requires_tests_pass: false,
    },
    PhaseTemplate {
        name: "implementation",
        agent: "developer",
        skills: &[
            ("code_generation", "Generate source code"),
            ("unit_test_writing", "Write and run unit tests"),
        ],
        gate: ("code_review", ArtifactType::SourceCode),
        min_review_rounds: Some(3),
        requires_tests_pass: true,
    },
    PhaseTemplate {
        name: "testing",
        agent: "qa_engineer",
        skills: &[
            ("test_plan_design", "Design the test plan"),
            ("test_case_design", "Design test cases"),
            ("test_automation", "Automate the test cases"),
        ],
        gate: ("test_review", ArtifactType::AutomatedTests),
        min_review_rounds: None,
        requires_tests_pass: false,
    },
];

/// Build the requirements -> design -> implementation -> testing pipeline.
///
/// Tasks are left unassigned so the orchestrator routes them by skill;
/// `agent` names only document the owning role. Tasks inside a phase form
/// a chain, and each phase's first task waits on the previous phase's last.
pub fn default_sdlc(project: &str, config: &WorkflowConfig) -> Result<WorkflowEngine> {
    let mut engine = WorkflowEngine::new(project, config);
    let mut previous_last = None;

    for template in PIPELINE {
        let mut phase = Phase::from_config(template.name, config).with_gate(ReviewGate::new(
            template.agent,
            template.gate.0,
            Some(template.gate.1),
        ));
        if let Some(rounds) = template.min_review_rounds {
            phase = phase.with_min_review_rounds(rounds.max(config.min_review_rounds));
        }
        if template.requires_tests_pass {
            phase = phase.requiring_tests_pass();
        }
        engine.add_phase(phase)?;

        let mut ids = Vec::new();
        for (skill, description) in template.skills {
            ids.push(engine.add_task(Task::new(template.name, "", skill, description))?);
        }
        engine.chain(template.name)?;

        if let (Some(prev), Some(first)) = (previous_last, ids.first()) {
            engine.add_dependency(&prev, first)?;
        }
        previous_last = ids.last().copied();
    }

    Ok(engine)
}
