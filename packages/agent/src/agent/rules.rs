// packages/agent/src/agent/rules.rs
//! Process rule matching
//!
//! Rules are a priority list: the first rule that supports the instance's
//! workflow language and whose selectors all match the instance labels wins.
//! A rule without selectors matches on language alone.

use crate::resources::{selector, ProcessRule, WorkflowAgent, WorkflowInstance};

/// Select the rule `agent` uses to run `instance`
pub fn match_rule<'a>(agent: &'a WorkflowAgent, instance: &WorkflowInstance) -> Option<&'a ProcessRule> {
    let language = instance.language()?;
    agent
        .spec
        .process_rules
        .iter()
        .find(|rule| rule_applies(rule, language, instance))
}

fn rule_applies(rule: &ProcessRule, language: &str, instance: &WorkflowInstance) -> bool {
    rule.supported_languages.iter().any(|l| l == language)
        && selector::selects_all(&rule.selectors, &instance.metadata.labels)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::{
        LabelSelector, ProcessConfiguration, ResourceMetadata, WorkflowInstanceSpec,
        WorkflowInstantiationType, DSL_LABEL,
    };
    use proptest::prelude::*;

    fn instance(language: Option<&str>, labels: &[(&str, &str)]) -> WorkflowInstance {
        let mut metadata = ResourceMetadata::new("default", "wf");
        if let Some(language) = language {
            metadata = metadata.with_label(DSL_LABEL, language);
        }
        for (k, v) in labels {
            metadata = metadata.with_label(*k, *v);
        }
        WorkflowInstance::new(
            metadata,
            WorkflowInstanceSpec::new(
                "greeter.default:1.0.0".parse().unwrap(),
                "key-1",
                WorkflowInstantiationType::Manual,
            ),
        )
    }

    fn agent(rules: Vec<ProcessRule>) -> WorkflowAgent {
        WorkflowAgent::new(ResourceMetadata::new("default", "agent"), rules)
    }

    fn rule(name: &str, languages: &[&str]) -> ProcessRule {
        ProcessRule::new(name, languages.iter().copied(), ProcessConfiguration::new(name))
    }

    #[test]
    fn test_first_matching_rule_wins() {
        let agent = agent(vec![
            rule("other", &["other:1.0.0"]),
            rule("r1", &["greet:1.0.0"]),
            rule("r2", &["greet:1.0.0"]),
        ]);
        let matched = match_rule(&agent, &instance(Some("greet:1.0.0"), &[])).unwrap();
        assert_eq!(matched.name, "r1");
    }

    #[test]
    fn test_selectors_must_all_match() {
        let agent = agent(vec![
            rule("gpu", &["greet:1.0.0"])
                .with_selector(LabelSelector::equals("tier", "gpu"))
                .with_selector(LabelSelector::exists("team")),
            rule("default", &["greet:1.0.0"]),
        ]);

        let partial = instance(Some("greet:1.0.0"), &[("tier", "gpu")]);
        assert_eq!(match_rule(&agent, &partial).unwrap().name, "default");

        let full = instance(Some("greet:1.0.0"), &[("tier", "gpu"), ("team", "a")]);
        assert_eq!(match_rule(&agent, &full).unwrap().name, "gpu");
    }

    #[test]
    fn test_no_match() {
        let agent = agent(vec![rule("r1", &["greet:1.0.0"])]);
        assert!(match_rule(&agent, &instance(Some("greet:2.0.0"), &[])).is_none());
        assert!(match_rule(&agent, &instance(None, &[])).is_none());
    }

    proptest! {
        #[test]
        fn prop_matching_is_deterministic_and_sound(
            rule_languages in prop::collection::vec(prop::collection::vec(0u8..4, 1..3), 1..6),
            rule_tiers in prop::collection::vec(prop::option::of(0u8..3), 1..6),
            language in 0u8..4,
            tier in 0u8..3,
        ) {
            let rules: Vec<ProcessRule> = rule_languages
                .iter()
                .enumerate()
                .map(|(i, languages)| {
                    let languages: Vec<String> =
                        languages.iter().map(|l| format!("lang{}:1.0.0", l)).collect();
                    let mut rule = ProcessRule::new(
                        format!("r{}", i),
                        languages,
                        ProcessConfiguration::new("true"),
                    );
                    if let Some(Some(t)) = rule_tiers.get(i) {
                        rule = rule.with_selector(LabelSelector::equals("tier", t.to_string()));
                    }
                    rule
                })
                .collect();
            let agent = agent(rules);
            let language = format!("lang{}:1.0.0", language);
            let tier = tier.to_string();
            let instance = instance(Some(language.as_str()), &[("tier", tier.as_str())]);

            let first = match_rule(&agent, &instance).map(|r| r.name.clone());
            let second = match_rule(&agent, &instance).map(|r| r.name.clone());
            prop_assert_eq!(&first, &second);

            // the match is the earliest applicable rule
            let expected = agent
                .spec
                .process_rules
                .iter()
                .find(|r| {
                    r.supported_languages.contains(&language)
                        && r.selectors.iter().all(|s| s.values == vec![tier.clone()])
                })
                .map(|r| r.name.clone());
            prop_assert_eq!(first, expected);
        }
    }
}
