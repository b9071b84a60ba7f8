use tracing::debug;

use crate::config::CardPolicy;
use crate::model::{CardInfo, CardKind, CardMode, ControllerKind, DeviceRecord};

/// Descriptor fields a keyword rule may inspect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    Model,
    Caption,
    Description,
    PnpDeviceId,
}

impl Field {
    fn read(self, record: &DeviceRecord) -> &str {
        match self {
            Field::Model => &record.model,
            Field::Caption => &record.caption,
            Field::Description => &record.description,
            Field::PnpDeviceId => &record.pnp_device_id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleAction {
    Reject,
    Accept(CardKind, ControllerKind),
}

/// One `(keyword set, verdict)` row. Keywords are matched case-insensitively
/// as substrings of any listed field.
#[derive(Debug, Clone, Copy)]
pub struct KeywordRule {
    pub id: &'static str,
    pub fields: &'static [Field],
    pub keywords: &'static [&'static str],
    pub action: RuleAction,
}

impl KeywordRule {
    pub fn matches(&self, record: &DeviceRecord) -> bool {
        self.fields
            .iter()
            .any(|field| contains_any(&field.read(record).to_uppercase(), self.keywords))
    }
}

const ALL_FIELDS: &[Field] = &[
    Field::Model,
    Field::Caption,
    Field::Description,
    Field::PnpDeviceId,
];

/// Removable media: USB exclusion first, then SD/MMC/card inclusion.
pub const REMOVABLE_RULES: &[KeywordRule] = &[
    KeywordRule {
        id: "removable_usb_exclusion",
        fields: &[Field::Model, Field::Caption, Field::Description],
        keywords: &["USB"],
        action: RuleAction::Reject,
    },
    KeywordRule {
        id: "removable_sd_inclusion",
        fields: &[Field::Model, Field::Caption],
        keywords: &["SD", "MMC", "CARD"],
        action: RuleAction::Accept(CardKind::LegacySd, ControllerKind::SdHost),
    },
];

/// Gate for the non-removable path: only NVMe/SD-looking devices go further.
pub const EXPRESS_CANDIDATE_GATE: KeywordRule = KeywordRule {
    id: "express_candidate_marker",
    fields: &[Field::Model, Field::Caption, Field::PnpDeviceId],
    keywords: &["NVM", "NVME", "SD", "SDEX"],
    action: RuleAction::Accept(CardKind::ExpressNvme, ControllerKind::Nvme),
};

/// Unpinned express heuristic. The SSD exclusion sits first so it always
/// wins over SD Express inclusion keywords.
pub const EXPRESS_RULES: &[KeywordRule] = &[
    KeywordRule {
        id: "express_ssd_exclusion",
        fields: ALL_FIELDS,
        keywords: &["SSD"],
        action: RuleAction::Reject,
    },
    KeywordRule {
        id: "express_keyword_inclusion",
        fields: ALL_FIELDS,
        keywords: &["SD EXPRESS", "SDEX", "SD-EXPRESS", "SD XS", "SDXC EXPRESS"],
        action: RuleAction::Accept(CardKind::ExpressNvme, ControllerKind::Nvme),
    },
];

/// Classification verdict plus the id of the rule that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub rule_id: &'static str,
    pub card: Option<CardInfo>,
}

pub fn classify(record: &DeviceRecord, policy: &CardPolicy) -> Option<CardInfo> {
    classify_with_trace(record, policy).card
}

pub fn classify_with_trace(record: &DeviceRecord, policy: &CardPolicy) -> Classification {
    debug!(
        model = %record.model,
        caption = %record.caption,
        description = %record.description,
        pnp = %record.pnp_device_id,
        removable = record.removable,
        "classifying device"
    );

    if record.removable {
        return match first_match(REMOVABLE_RULES, record) {
            Some(rule) => verdict(rule.id, rule.action, record),
            None => unmatched("removable_unrecognized"),
        };
    }

    if !EXPRESS_CANDIDATE_GATE.matches(record) {
        return unmatched("no_card_marker");
    }

    if let Some(pinned) = policy.pinned_model() {
        if record.model.to_uppercase().contains(&pinned.to_uppercase()) {
            debug!(model = %record.model, "matched pinned SD Express model");
            return verdict(
                "pinned_model_match",
                RuleAction::Accept(CardKind::ExpressNvme, ControllerKind::Nvme),
                record,
            );
        }
        return unmatched("pinned_model_mismatch");
    }

    match first_match(EXPRESS_RULES, record) {
        Some(rule) => verdict(rule.id, rule.action, record),
        None => unmatched("express_no_keyword"),
    }
}

fn first_match<'a>(rules: &'a [KeywordRule], record: &DeviceRecord) -> Option<&'a KeywordRule> {
    rules.iter().find(|rule| rule.matches(record))
}

fn verdict(rule_id: &'static str, action: RuleAction, record: &DeviceRecord) -> Classification {
    let card = match action {
        RuleAction::Reject => None,
        RuleAction::Accept(kind, controller) => Some(CardInfo {
            kind,
            controller,
            mode: CardMode::Unknown,
            device_path: record.device_path.clone(),
            drive_letter: record.drive_letter.clone().unwrap_or_default(),
            capacity_bytes: 0,
            name: record.model.clone(),
        }),
    };
    debug!(rule_id, accepted = card.is_some(), "classification rule fired");
    Classification { rule_id, card }
}

fn unmatched(rule_id: &'static str) -> Classification {
    Classification {
        rule_id,
        card: None,
    }
}

fn contains_any(value: &str, patterns: &[&str]) -> bool {
    patterns.iter().any(|pattern| value.contains(pattern))
}
