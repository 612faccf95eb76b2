//! Paid Agent Catalog
//!
//! Agents are static templates: running one renders its template with the
//! caller's input. Each run is charged through the execution gate.

use anyhow::bail;

/// A paid agent
#[derive(Clone, Copy, Debug)]
pub struct AgentTemplate {
    pub id: &'static str,
    pub name: &'static str,

    /// Credits charged per run
    pub cost: i64,

    template: &'static str,
}

const MAX_INPUT_CHARS: usize = 4000;

pub const CATALOG: &[AgentTemplate] = &[
    AgentTemplate {
        id: "summarizer",
        name: "Summarizer",
        cost: 5,
        template: "Summary of your text: {input}",
    },
    AgentTemplate {
        id: "translator",
        name: "Translator",
        cost: 8,
        template: "Translation request received: {input}",
    },
    AgentTemplate {
        id: "researcher",
        name: "Research Assistant",
        cost: 20,
        template: "Research brief on: {input}",
    },
];

impl AgentTemplate {
    pub fn find(id: &str) -> Option<&'static Self> {
        CATALOG.iter().find(|agent| agent.id == id)
    }

    /// Render the template; fails on empty or oversized input
    pub fn run(&self, input: &str) -> anyhow::Result<String> {
        let input = input.trim();
        if input.is_empty() {
            bail!("{} needs non-empty input", self.name);
        }
        if input.chars().count() > MAX_INPUT_CHARS {
            bail!("{} input exceeds {MAX_INPUT_CHARS} characters", self.name);
        }
        Ok(self.template.replace("{input}", input))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalog_lookup() {
        let agent = AgentTemplate::find("summarizer").unwrap();
        assert_eq!(agent.cost, 5);
        assert!(AgentTemplate::find("oracle").is_none());
    }

    #[test]
    fn test_run_renders_template() {
        let agent = AgentTemplate::find("researcher").unwrap();
        assert_eq!(agent.run("  rust ").unwrap(), "Research brief on: rust");
        assert!(agent.run("   ").is_err());
    }
}
