//! Asset payloads embedded in output scripts.
//!
//! An asset-carrying output is an ordinary payment script followed by
//! the asset marker opcode, a single push of `"cvd" + type + data`, and
//! `OP_DROP`. Only the pushed payload matters here; the payment prefix
//! is opaque.

use corvid_consensus::constants::MAX_ASSET_NAME_LEN;

use crate::encoding::{DecodeError, Decoder};

pub const OP_ASSET_MARKER: u8 = 0xc0;
pub const ASSET_TAG: [u8; 3] = *b"cvd";
pub const CONTENT_POINTER_LEN: usize = 34;

/// Divisions value in a reissue payload meaning "leave unchanged".
pub const DIVISIONS_UNCHANGED: u8 = 0xff;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AssetIssuance {
    pub name: String,
    pub amount: u64,
    pub divisions: u8,
    pub reissuable: bool,
    pub content: Option<[u8; CONTENT_POINTER_LEN]>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AssetReissue {
    pub name: String,
    /// Additional amount minted on top of the existing circulation.
    pub amount: u64,
    pub divisions: u8,
    pub reissuable: bool,
    pub content: Option<[u8; CONTENT_POINTER_LEN]>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AssetScript {
    Issue(AssetIssuance),
    Reissue(AssetReissue),
    Transfer { name: String, amount: u64 },
    Ownership { name: String },
}

impl AssetScript {
    pub fn name(&self) -> &str {
        match self {
            AssetScript::Issue(issue) => &issue.name,
            AssetScript::Reissue(reissue) => &reissue.name,
            AssetScript::Transfer { name, .. } => name,
            AssetScript::Ownership { name } => name,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssetScriptError {
    Truncated,
    BadTag,
    UnknownType(u8),
    BadName,
    BadDivisions(u8),
    TrailingBytes,
}

impl std::fmt::Display for AssetScriptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AssetScriptError::Truncated => write!(f, "truncated asset payload"),
            AssetScriptError::BadTag => write!(f, "missing asset tag"),
            AssetScriptError::UnknownType(t) => write!(f, "unknown asset payload type {t:#04x}"),
            AssetScriptError::BadName => write!(f, "invalid asset name"),
            AssetScriptError::BadDivisions(d) => write!(f, "divisions out of range: {d}"),
            AssetScriptError::TrailingBytes => write!(f, "trailing bytes in asset payload"),
        }
    }
}

impl std::error::Error for AssetScriptError {}

impl From<DecodeError> for AssetScriptError {
    fn from(_: DecodeError) -> Self {
        AssetScriptError::Truncated
    }
}

/// Extract and parse the asset payload from an output script.
/// `Ok(None)` means the script carries no asset at all.
pub fn parse_asset_script(script: &[u8]) -> Result<Option<AssetScript>, AssetScriptError> {
    let Some(payload) = extract_payload(script) else {
        return Ok(None);
    };
    parse_payload(payload).map(Some)
}

fn extract_payload(script: &[u8]) -> Option<&[u8]> {
    let marker = script.iter().position(|b| *b == OP_ASSET_MARKER)?;
    let rest = &script[marker + 1..];
    let (len, data) = match *rest.first()? {
        // OP_PUSHDATA1
        0x4c => {
            let len = *rest.get(1)? as usize;
            (len, rest.get(2..)?)
        }
        // OP_PUSHDATA2
        0x4d => {
            let len = u16::from_le_bytes([*rest.get(1)?, *rest.get(2)?]) as usize;
            (len, rest.get(3..)?)
        }
        op if op as usize <= 75 => (op as usize, rest.get(1..)?),
        _ => return None,
    };
    data.get(..len)
}

fn parse_payload(payload: &[u8]) -> Result<AssetScript, AssetScriptError> {
    if payload.len() < 4 {
        return Err(AssetScriptError::Truncated);
    }
    if payload[..3] != ASSET_TAG {
        return Err(AssetScriptError::BadTag);
    }
    let kind = payload[3];
    let mut decoder = Decoder::new(&payload[4..]);
    let name = read_name(&mut decoder)?;

    let script = match kind {
        b'q' => {
            let amount = decoder.read_u64_le()?;
            let divisions = decoder.read_u8()?;
            if divisions > 8 {
                return Err(AssetScriptError::BadDivisions(divisions));
            }
            let reissuable = decoder.read_bool()?;
            let has_content = decoder.read_bool()?;
            let content = if has_content {
                Some(decoder.read_fixed::<CONTENT_POINTER_LEN>()?)
            } else {
                None
            };
            AssetScript::Issue(AssetIssuance {
                name,
                amount,
                divisions,
                reissuable,
                content,
            })
        }
        b'r' => {
            let amount = decoder.read_u64_le()?;
            let divisions = decoder.read_u8()?;
            if divisions > 8 && divisions != DIVISIONS_UNCHANGED {
                return Err(AssetScriptError::BadDivisions(divisions));
            }
            let reissuable = decoder.read_bool()?;
            // a reissue may optionally replace the content pointer
            let content = if decoder.remaining() >= CONTENT_POINTER_LEN {
                Some(decoder.read_fixed::<CONTENT_POINTER_LEN>()?)
            } else {
                None
            };
            AssetScript::Reissue(AssetReissue {
                name,
                amount,
                divisions,
                reissuable,
                content,
            })
        }
        b't' => {
            let amount = decoder.read_u64_le()?;
            AssetScript::Transfer { name, amount }
        }
        b'o' => AssetScript::Ownership { name },
        other => return Err(AssetScriptError::UnknownType(other)),
    };

    if !decoder.is_empty() {
        return Err(AssetScriptError::TrailingBytes);
    }
    Ok(script)
}

fn read_name(decoder: &mut Decoder) -> Result<String, AssetScriptError> {
    let bytes = decoder.read_var_bytes()?;
    if bytes.is_empty() || bytes.len() > MAX_ASSET_NAME_LEN + 1 {
        return Err(AssetScriptError::BadName);
    }
    let valid = bytes
        .iter()
        .all(|b| b.is_ascii_uppercase() || b.is_ascii_digit() || matches!(b, b'.' | b'_' | b'/' | b'#' | b'!'));
    if !valid {
        return Err(AssetScriptError::BadName);
    }
    String::from_utf8(bytes).map_err(|_| AssetScriptError::BadName)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wrap(payload: &[u8]) -> Vec<u8> {
        // p2pkh-ish prefix, marker, direct push, OP_DROP
        let mut script = vec![0x76, 0xa9, 0x14];
        script.extend_from_slice(&[0u8; 20]);
        script.extend_from_slice(&[0x88, 0xac, OP_ASSET_MARKER, payload.len() as u8]);
        script.extend_from_slice(payload);
        script.push(0x75);
        script
    }

    fn issue_payload(name: &str, amount: u64, divisions: u8, reissuable: bool) -> Vec<u8> {
        let mut payload = ASSET_TAG.to_vec();
        payload.push(b'q');
        payload.push(name.len() as u8);
        payload.extend_from_slice(name.as_bytes());
        payload.extend_from_slice(&amount.to_le_bytes());
        payload.push(divisions);
        payload.push(reissuable as u8);
        payload.push(0);
        payload
    }

    #[test]
    fn plain_script_has_no_asset() {
        let script = vec![0x76, 0xa9, 0x14, 0x00, 0x88, 0xac];
        assert_eq!(parse_asset_script(&script), Ok(None));
    }

    #[test]
    fn parse_issue() {
        let script = wrap(&issue_payload("CROW", 1_000_000, 2, true));
        let parsed = parse_asset_script(&script).unwrap().unwrap();
        assert_eq!(
            parsed,
            AssetScript::Issue(AssetIssuance {
                name: "CROW".into(),
                amount: 1_000_000,
                divisions: 2,
                reissuable: true,
                content: None,
            })
        );
    }

    #[test]
    fn parse_reissue_with_content() {
        let mut payload = ASSET_TAG.to_vec();
        payload.push(b'r');
        payload.extend_from_slice(&[4]);
        payload.extend_from_slice(b"CROW");
        payload.extend_from_slice(&500u64.to_le_bytes());
        payload.push(DIVISIONS_UNCHANGED);
        payload.push(1);
        payload.extend_from_slice(&[7u8; CONTENT_POINTER_LEN]);
        let parsed = parse_asset_script(&wrap(&payload)).unwrap().unwrap();
        match parsed {
            AssetScript::Reissue(reissue) => {
                assert_eq!(reissue.amount, 500);
                assert_eq!(reissue.divisions, DIVISIONS_UNCHANGED);
                assert_eq!(reissue.content, Some([7u8; CONTENT_POINTER_LEN]));
            }
            other => panic!("unexpected parse: {other:?}"),
        }
    }

    #[test]
    fn parse_transfer_and_ownership() {
        let mut payload = ASSET_TAG.to_vec();
        payload.extend_from_slice(b"t\x04CROW");
        payload.extend_from_slice(&42u64.to_le_bytes());
        assert_eq!(
            parse_asset_script(&wrap(&payload)).unwrap().unwrap(),
            AssetScript::Transfer {
                name: "CROW".into(),
                amount: 42
            }
        );

        let mut payload = ASSET_TAG.to_vec();
        payload.extend_from_slice(b"o\x05CROW!");
        assert_eq!(
            parse_asset_script(&wrap(&payload)).unwrap().unwrap(),
            AssetScript::Ownership {
                name: "CROW!".into()
            }
        );
    }

    #[test]
    fn bad_payloads_rejected() {
        let mut bad_tag = issue_payload("CROW", 1, 0, false);
        bad_tag[0] = b'x';
        assert_eq!(
            parse_asset_script(&wrap(&bad_tag)),
            Err(AssetScriptError::BadTag)
        );

        let bad_div = issue_payload("CROW", 1, 9, false);
        assert_eq!(
            parse_asset_script(&wrap(&bad_div)),
            Err(AssetScriptError::BadDivisions(9))
        );

        let lowercase = issue_payload("crow", 1, 0, false);
        assert_eq!(
            parse_asset_script(&wrap(&lowercase)),
            Err(AssetScriptError::BadName)
        );

        let mut trailing = issue_payload("CROW", 1, 0, false);
        trailing.push(0);
        assert_eq!(
            parse_asset_script(&wrap(&trailing)),
            Err(AssetScriptError::TrailingBytes)
        );
    }
}
