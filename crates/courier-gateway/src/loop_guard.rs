use courier_core::InboundMessage;

/// Subtypes that still carry a human-authored message.
const USER_SUBTYPES: &[&str] = &["file_share", "thread_broadcast", "me_message"];

/// Whether an inbound message came from a bot (the relay included) or the
/// platform itself. Any one signal is enough.
pub(crate) fn is_self_originated(msg: &InboundMessage, self_user_id: Option<&str>) -> bool {
    if msg.bot_id.is_some() {
        return true;
    }

    if let Some(subtype) = msg.subtype.as_deref()
        && !USER_SUBTYPES.contains(&subtype)
    {
        return true;
    }

    matches!(
        (msg.sender.as_deref(), self_user_id),
        (Some(sender), Some(own)) if sender == own
    )
}
