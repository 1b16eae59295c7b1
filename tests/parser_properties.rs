//! Property tests for the command parser
//!
//! Canonical rendering must re-parse to the same tree, and no input may make
//! the parser panic.

use o_kernel::grammar::{MAX_COMMAND_LENGTH, Node, parse};
use proptest::prelude::*;

fn arb_name() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9_]{0,7}"
}

/// One whitespace-separated token of a well-formed command body.
fn arb_token() -> impl Strategy<Value = String> {
    prop_oneof![
        arb_name().prop_map(|name| format!("@{name}")),
        arb_name().prop_map(|name| format!("#{name}")),
        proptest::collection::vec(arb_name(), 1..4)
            .prop_map(|names| format!("@({})", names.join(", "))),
        "[A-Za-z][A-Za-z0-9,.!']{0,8}",
        Just("?(up)".to_string()),
        Just("?(sleep(3) or from(@bob))".to_string()),
        Just("?(not nbox(@bob, 2) and published(@carol))".to_string()),
        Just("$(\\ping @alice ---)".to_string()),
    ]
}

fn arb_command_text() -> impl Strategy<Value = String> {
    (arb_name(), proptest::collection::vec(arb_token(), 0..8)).prop_map(|(verb, tokens)| {
        let mut text = format!("\\{verb}");
        for token in tokens {
            text.push(' ');
            text.push_str(&token);
        }
        text.push_str(" ---");
        text
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Rendering a parsed command and parsing it again is the identity.
    #[test]
    fn prop_canonical_rendering_reparses(text in arb_command_text()) {
        let command = parse(&text).expect("generated command parses");
        let rendered = command.to_string();
        let reparsed = parse(&rendered).expect("canonical rendering parses");
        prop_assert_eq!(&reparsed, &command);
        prop_assert_eq!(reparsed.to_string(), rendered);
    }

    /// Entity references survive parsing in input order.
    #[test]
    fn prop_entity_refs_keep_order(
        verb in arb_name(),
        names in proptest::collection::vec(arb_name(), 1..6),
    ) {
        let refs: Vec<String> = names.iter().map(|name| format!("@{name}")).collect();
        let command = parse(&format!("\\{verb} {} ---", refs.join(" "))).expect("parses");
        let parsed: Vec<&str> = command.entity_refs().collect();
        prop_assert_eq!(parsed, names.iter().map(String::as_str).collect::<Vec<_>>());
        prop_assert!(command.nodes.iter().all(|node| matches!(node, Node::EntityRef(_))));
    }

    /// Arbitrary input is either parsed or rejected with an in-range position.
    #[test]
    fn prop_arbitrary_input_never_panics(text in "\\PC{0,64}") {
        if let Err(err) = parse(&text) {
            prop_assert!(err.position >= 1);
            prop_assert!(err.position <= text.chars().count() + 1);
        }
    }

    /// Arbitrary input after a valid prefix is handled without panicking.
    #[test]
    fn prop_noisy_bodies_never_panic(verb in arb_name(), body in "[ -~]{0,48}") {
        let _ = parse(&format!("\\{verb} {body} ---"));
    }
}

#[test]
fn test_length_limit_is_inclusive() {
    let filler = "x".repeat(MAX_COMMAND_LENGTH - "\\say  ---".len());
    let at_limit = format!("\\say {filler} ---");
    assert_eq!(at_limit.chars().count(), MAX_COMMAND_LENGTH);
    assert!(parse(&at_limit).is_ok());

    let over = format!("\\say {filler}x ---");
    let err = parse(&over).unwrap_err();
    assert!(err.message.contains("too long"));
}
