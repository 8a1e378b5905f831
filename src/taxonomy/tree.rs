//! Ordered rule tables for the taxonomic decision trees.
//!
//! A [`DecisionTable`] is a list of named `(predicate, outcome)` rules plus a
//! fallback outcome. Rules are tried in order and the first predicate that
//! holds wins; when none holds the fallback applies, so every input maps to
//! exactly one outcome.

/// One branch of a decision tree.
pub struct Rule<P, O> {
    pub name: &'static str,
    pub test: fn(&P) -> bool,
    pub outcome: O,
}

impl<P, O> Rule<P, O> {
    pub fn new(name: &'static str, test: fn(&P) -> bool, outcome: O) -> Self {
        Rule {
            name,
            test,
            outcome,
        }
    }
}

/// The rule that fired (or `"fallback"`) and its outcome.
#[derive(Debug)]
pub struct Decision<'t, O> {
    pub rule: &'static str,
    pub outcome: &'t O,
}

pub struct DecisionTable<P, O> {
    rules: Vec<Rule<P, O>>,
    fallback: O,
}

impl<P, O> DecisionTable<P, O> {
    pub fn new(rules: Vec<Rule<P, O>>, fallback: O) -> Self {
        DecisionTable { rules, fallback }
    }

    pub fn evaluate(&self, point: &P) -> Decision<'_, O> {
        self.rules
            .iter()
            .find(|rule| (rule.test)(point))
            .map(|rule| Decision {
                rule: rule.name,
                outcome: &rule.outcome,
            })
            .unwrap_or(Decision {
                rule: "fallback",
                outcome: &self.fallback,
            })
    }
}
