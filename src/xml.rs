//! RPC 協定使用的 SOAP 封包：請求序列化與回應解析。
//!
//! 回應會被轉換成 [`serde_json::Value`] 樹，元素名稱去除命名空間前綴，
//! 使錯誤分類器可以用與 JSON 協定相同的路徑查詢方式處理。

use quick_xml::{escape::escape, events::Event, Reader};
use serde_json::{Map, Value};
use thiserror::Error;

pub const SOAP_ENVELOPE_NS: &str = "http://schemas.xmlsoap.org/soap/envelope/";
pub const RP_TYPES_NS: &str = "http://bankid.com/RpService/v4.0.0/types/";

/// XML 格式錯誤。
#[derive(Debug, Error)]
#[error("Malformed XML: {0}")]
pub struct XmlError(String);

/// 建立 SOAP 請求封包。
///
/// 有 `request_element` 時參數包在該元素中（例如 `typ:AuthenticateRequest`），
/// 否則參數直接作為 `Body` 的子元素。
pub fn envelope(request_element: Option<&str>, params: &Map<String, Value>) -> String {
    let mut body = String::new();
    match request_element {
        Some(element) => {
            body.push_str(&format!("<typ:{element}>"));
            for (name, value) in params {
                write_element(&mut body, None, name, value);
            }
            body.push_str(&format!("</typ:{element}>"));
        }
        None => {
            for (name, value) in params {
                write_element(&mut body, Some("typ"), name, value);
            }
        }
    }

    format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
         <soapenv:Envelope xmlns:soapenv=\"{SOAP_ENVELOPE_NS}\" xmlns:typ=\"{RP_TYPES_NS}\">\
         <soapenv:Header/><soapenv:Body>{body}</soapenv:Body></soapenv:Envelope>"
    )
}

fn write_element(out: &mut String, prefix: Option<&str>, name: &str, value: &Value) {
    let tag = match prefix {
        Some(prefix) => format!("{prefix}:{name}"),
        None => name.to_string(),
    };
    match value {
        Value::Null => {}
        Value::Array(items) => {
            for item in items {
                write_element(out, prefix, name, item);
            }
        }
        Value::Object(children) => {
            out.push_str(&format!("<{tag}>"));
            for (child, value) in children {
                write_element(out, None, child, value);
            }
            out.push_str(&format!("</{tag}>"));
        }
        Value::String(text) => out.push_str(&format!("<{tag}>{}</{tag}>", escape(text.as_str()))),
        other => out.push_str(&format!("<{tag}>{other}</{tag}>")),
    }
}

/// 解析中的元素。
struct Node {
    name: String,
    children: Map<String, Value>,
    text: String,
}

impl Node {
    fn new(name: String) -> Self {
        Self {
            name,
            children: Map::new(),
            text: String::new(),
        }
    }

    fn into_value(self) -> Value {
        if self.children.is_empty() {
            Value::String(self.text)
        } else {
            Value::Object(self.children)
        }
    }
}

/// 重複出現的元素會合併為陣列。
fn insert(map: &mut Map<String, Value>, name: String, value: Value) {
    match map.get_mut(&name) {
        Some(Value::Array(items)) => items.push(value),
        Some(existing) => {
            let first = existing.take();
            *existing = Value::Array(vec![first, value]);
        }
        None => {
            map.insert(name, value);
        }
    }
}

/// 將 XML 文件轉換成樹狀結構，根物件的唯一鍵即為根元素名稱。
///
/// # Errors
///
/// 文件格式錯誤或元素未正確關閉時回傳 [`XmlError`]。
pub fn parse(xml: &str) -> Result<Value, XmlError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut stack = vec![Node::new(String::new())];
    loop {
        match reader
            .read_event()
            .map_err(|e| XmlError(e.to_string()))?
        {
            Event::Start(start) => {
                let name = String::from_utf8_lossy(start.local_name().as_ref()).into_owned();
                stack.push(Node::new(name));
            }
            Event::Empty(empty) => {
                let name = String::from_utf8_lossy(empty.local_name().as_ref()).into_owned();
                if let Some(parent) = stack.last_mut() {
                    insert(&mut parent.children, name, Value::String(String::new()));
                }
            }
            Event::Text(text) => {
                let text = text.unescape().map_err(|e| XmlError(e.to_string()))?;
                if let Some(node) = stack.last_mut() {
                    node.text.push_str(&text);
                }
            }
            Event::CData(data) => {
                if let Some(node) = stack.last_mut() {
                    node.text.push_str(&String::from_utf8_lossy(&data));
                }
            }
            Event::End(_) => {
                if stack.len() < 2 {
                    return Err(XmlError("unexpected closing tag".into()));
                }
                let node = stack.pop().ok_or_else(|| XmlError("empty stack".into()))?;
                if let Some(parent) = stack.last_mut() {
                    let name = node.name.clone();
                    insert(&mut parent.children, name, node.into_value());
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    match stack.pop() {
        Some(root) if stack.is_empty() && !root.children.is_empty() => {
            Ok(Value::Object(root.children))
        }
        Some(_) if !stack.is_empty() => Err(XmlError("unclosed element".into())),
        _ => Err(XmlError("document has no root element".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fault::lookup;
    use serde_json::json;

    #[test]
    fn test_envelope_with_request_element() {
        let params = json!({
            "personalNumber": "190101014801",
            "requirementAlternatives": [
                {"requirement": {"key": "certificatePolicies", "value": "1.2.3"}}
            ],
            "endUserInfo": [
                {"type": "IP_ADDR", "value": "127.0.0.1"},
                {"type": "DEVICE", "value": "a&b"}
            ]
        });
        let xml = envelope(Some("AuthenticateRequest"), params.as_object().unwrap());

        assert!(xml.contains("<typ:AuthenticateRequest><personalNumber>190101014801</personalNumber>"));
        assert!(xml.contains(
            "<requirementAlternatives><requirement><key>certificatePolicies</key><value>1.2.3</value></requirement></requirementAlternatives>"
        ));
        assert_eq!(xml.matches("<endUserInfo>").count(), 2);
        assert!(xml.contains("<value>a&amp;b</value>"));
        assert!(xml.ends_with("</typ:AuthenticateRequest></soapenv:Body></soapenv:Envelope>"));
    }

    #[test]
    fn test_envelope_without_request_element() {
        let params = json!({"orderRef": "abc-123"});
        let xml = envelope(None, params.as_object().unwrap());
        assert!(xml.contains("<soapenv:Body><typ:orderRef>abc-123</typ:orderRef></soapenv:Body>"));
    }

    #[test]
    fn test_parse_strips_prefixes_and_groups_repeats() {
        let xml = r#"<?xml version="1.0"?>
            <S:Envelope xmlns:S="http://schemas.xmlsoap.org/soap/envelope/">
              <S:Body>
                <ns2:CollectResponse xmlns:ns2="http://bankid.com/RpService/v4.0.0/types/">
                  <progressStatus>OUTSTANDING_TRANSACTION</progressStatus>
                  <item>1</item><item>2</item>
                  <empty/>
                  <escaped>a &amp; b</escaped>
                </ns2:CollectResponse>
              </S:Body>
            </S:Envelope>"#;
        let tree = parse(xml).unwrap();
        let response = lookup(&tree, "Envelope.Body.CollectResponse").unwrap();
        assert_eq!(response["progressStatus"], json!("OUTSTANDING_TRANSACTION"));
        assert_eq!(response["item"], json!(["1", "2"]));
        assert_eq!(response["empty"], json!(""));
        assert_eq!(response["escaped"], json!("a & b"));
    }

    #[test]
    fn test_parse_rejects_broken_documents() {
        assert!(parse("<a><b></b>").is_err());
        assert!(parse("").is_err());
        assert!(parse("<a></b>").is_err());
    }
}
