use std::collections::BTreeSet;

use proptest::prelude::*;
use sipdrill_scenario_core::diversion::{evaluate, simservs, CallConditions, DiversionCondition, DiversionOutcome};
use sipdrill_scenario_core::{DiversionRule, DiversionRuleSet, MediaType};

fn condition() -> impl Strategy<Value = DiversionCondition> {
    prop::sample::select(DiversionCondition::ALL.to_vec())
}

fn media() -> impl Strategy<Value = Vec<MediaType>> {
    prop::sample::subsequence(vec![MediaType::Audio, MediaType::Video], 0..=2)
}

prop_compose! {
    fn rule()(
        conditions in prop::collection::btree_set(condition(), 0..3),
        media in media(),
        user in 1000u32..9999,
    ) -> DiversionRule {
        DiversionRule {
            conditions,
            media_conditions: media,
            target: format!("sip:{}@sipdrill.test", user),
        }
    }
}

proptest! {
    #[test]
    fn evaluation_picks_the_first_matching_rule(
        rules in prop::collection::vec(rule(), 0..6),
        conditions in prop::collection::btree_set(condition(), 0..4),
        offered in media(),
    ) {
        let set = DiversionRuleSet::new(rules.clone());
        let conditions: CallConditions = conditions;
        let expected = rules.iter().position(|r| {
            r.conditions.is_subset(&conditions) && r.media_conditions.iter().all(|m| offered.contains(m))
        });

        match evaluate(&set, &conditions, &offered) {
            DiversionOutcome::Forward { target, rule_index } => {
                prop_assert_eq!(Some(rule_index), expected);
                prop_assert_eq!(&target, &rules[rule_index].target);
            }
            DiversionOutcome::NoMatch => prop_assert_eq!(expected, None),
        }
    }

    #[test]
    fn inactive_rule_sets_never_divert(
        rules in prop::collection::vec(rule(), 0..6),
        conditions in prop::collection::btree_set(condition(), 0..4),
    ) {
        let set = DiversionRuleSet::new(rules).inactive();
        prop_assert_eq!(evaluate(&set, &conditions, &[MediaType::Audio, MediaType::Video]), DiversionOutcome::NoMatch);
    }

    #[test]
    fn simservs_document_preserves_evaluation(
        rules in prop::collection::vec(rule(), 1..5),
        conditions in prop::collection::btree_set(condition(), 0..4),
        offered in media(),
    ) {
        let set = DiversionRuleSet::new(rules).with_no_answer_timeout(7);
        let parsed = simservs::parse(&simservs::render(&set).unwrap()).unwrap();
        prop_assert_eq!(evaluate(&parsed, &conditions, &offered), evaluate(&set, &conditions, &offered));
    }
}

#[test]
fn test_unconditional_rule_shadows_later_rules() {
    let set = DiversionRuleSet::new(vec![
        DiversionRule::to("sip:first@sipdrill.test"),
        DiversionRule::to("sip:busy@sipdrill.test").when(DiversionCondition::Busy),
    ]);
    let busy: CallConditions = BTreeSet::from([DiversionCondition::Busy]);
    assert_eq!(evaluate(&set, &busy, &[]).target(), Some("sip:first@sipdrill.test"));
}
