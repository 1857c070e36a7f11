//! Directory payload normalization.
//!
//! Adapters hand raw API payloads to these helpers to get a
//! [`NormalizedMember`]. A payload without a usable email yields `None`.

use serde_json::Value;

use super::NormalizedMember;

fn str_field<'a>(value: &'a Value, pointer: &str) -> Option<&'a str> {
    value
        .pointer(pointer)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// Normalize a Google Directory member resource.
///
/// Reads `email`, `id`, `role` and the optional `name.givenName` /
/// `name.familyName` pair.
#[must_use]
pub fn google_member(raw: &Value) -> Option<NormalizedMember> {
    let email = str_field(raw, "/email")?;
    let mut member = NormalizedMember::new(email);
    member.id = str_field(raw, "/id").map(str::to_string);
    member.provider_member_id = member.id.clone();
    member.role = str_field(raw, "/role").map(str::to_lowercase);
    member.first_name = str_field(raw, "/name/givenName").map(str::to_string);
    member.family_name = str_field(raw, "/name/familyName").map(str::to_string);
    member.raw = Some(raw.clone());
    Some(member)
}

/// Normalize an AWS Identity Store user.
///
/// Prefers the primary entry in `Emails`, then the first entry, then a
/// `UserName` that looks like an email.
#[must_use]
pub fn aws_member(raw: &Value) -> Option<NormalizedMember> {
    let emails = raw.get("Emails").and_then(Value::as_array);
    let email = emails
        .and_then(|list| {
            list.iter()
                .find(|e| e.get("Primary").and_then(Value::as_bool) == Some(true))
                .or_else(|| list.first())
        })
        .and_then(|e| str_field(e, "/Value"))
        .or_else(|| str_field(raw, "/UserName").filter(|u| u.contains('@')))?;

    let mut member = NormalizedMember::new(email);
    member.id = str_field(raw, "/UserId").map(str::to_string);
    member.provider_member_id = str_field(raw, "/MembershipId")
        .map(str::to_string)
        .or_else(|| member.id.clone());
    member.first_name = str_field(raw, "/Name/GivenName").map(str::to_string);
    member.family_name = str_field(raw, "/Name/FamilyName").map(str::to_string);
    member.raw = Some(raw.clone());
    Some(member)
}
