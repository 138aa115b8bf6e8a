use std::collections::HashMap;

use crate::kv::Condition;
use crate::models::EtcdError;

/// Decoded request fields. etcd v2 accepts parameters in the query
/// string or the form body; `merged` applies the body-wins rule.
#[derive(Debug, Default)]
pub struct Fields(HashMap<String, String>);

impl Fields {
    pub fn parse(raw: &str) -> Result<Fields, EtcdError> {
        let pairs: Vec<(String, String)> = serde_urlencoded::from_str(raw)
            .map_err(|err| EtcdError::invalid_field(err.to_string()))?;
        let mut map = HashMap::new();
        for (key, value) in pairs {
            // first occurrence wins, like url.Values.Get
            map.entry(key).or_insert(value);
        }
        Ok(Fields(map))
    }

    /// Body fields take precedence over query fields.
    pub fn merged(query: Option<&str>, form: &str) -> Result<Fields, EtcdError> {
        let mut fields = Fields::parse(form)?;
        let query = Fields::parse(query.unwrap_or(""))?;
        for (key, value) in query.0 {
            fields.0.entry(key).or_insert(value);
        }
        Ok(fields)
    }

    fn raw(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    pub fn string(&self, name: &str) -> String {
        self.raw(name).unwrap_or_default().to_string()
    }

    /// An absent or empty field is no value at all.
    pub fn opt_string(&self, name: &str) -> Option<String> {
        self.raw(name).filter(|s| !s.is_empty()).map(str::to_string)
    }

    /// etcd's lenient booleans: absent, empty and "false" are false,
    /// anything else is true.
    pub fn bool(&self, name: &str) -> bool {
        !matches!(self.raw(name), None | Some("") | Some("false"))
    }

    pub fn opt_bool(&self, name: &str) -> Option<bool> {
        match self.raw(name) {
            None | Some("") => None,
            Some("false") => Some(false),
            Some(_) => Some(true),
        }
    }

    pub fn int(&self, name: &str) -> Result<Option<i64>, EtcdError> {
        match self.raw(name) {
            None | Some("") => Ok(None),
            Some(raw) => raw.parse::<i64>().map(Some).map_err(|_| {
                EtcdError::invalid_field(format!("invalid value for {}: {}", name, raw))
            }),
        }
    }
}

/// Normalizes the wildcard tail of `/v2/keys/...` into an absolute key:
/// one leading slash, trailing slashes trimmed, bare root stays `/`.
pub fn normalize_key(path: &str) -> String {
    let trimmed = path.trim_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", trimmed)
    }
}

#[derive(Debug)]
pub struct GetParams {
    pub wait: bool,
    pub wait_index: Option<i64>,
    pub recursive: bool,
    pub sorted: bool,
}

impl GetParams {
    pub fn from_fields(fields: &Fields) -> Result<GetParams, EtcdError> {
        Ok(GetParams {
            wait: fields.bool("wait"),
            wait_index: fields.int("waitIndex")?,
            recursive: fields.bool("recursive"),
            sorted: fields.bool("sorted"),
        })
    }
}

#[derive(Debug)]
pub struct SetParams {
    pub value: String,
    pub ttl: Option<i64>,
    pub dir: bool,
    pub prev_value: Option<String>,
    pub prev_index: Option<i64>,
    pub prev_exist: Option<bool>,
}

impl SetParams {
    pub fn from_fields(fields: &Fields) -> Result<SetParams, EtcdError> {
        Ok(SetParams {
            value: fields.string("value"),
            ttl: fields.int("ttl")?,
            dir: fields.bool("dir"),
            prev_value: fields.opt_string("prevValue"),
            prev_index: fields.int("prevIndex")?,
            prev_exist: fields.opt_bool("prevExist"),
        })
    }

    pub fn condition(&self) -> Condition {
        if let Some(prev_exist) = self.prev_exist {
            Condition::PrevExist(prev_exist)
        } else if let Some(prev_value) = &self.prev_value {
            Condition::PrevValue(prev_value.clone())
        } else if let Some(prev_index) = self.prev_index {
            Condition::PrevIndex(prev_index)
        } else {
            Condition::Always
        }
    }
}

#[derive(Debug)]
pub struct DeleteParams {
    pub prev_value: Option<String>,
    pub prev_index: Option<i64>,
    pub dir: bool,
    pub recursive: bool,
}

impl DeleteParams {
    pub fn from_fields(fields: &Fields) -> Result<DeleteParams, EtcdError> {
        Ok(DeleteParams {
            prev_value: fields.opt_string("prevValue"),
            prev_index: fields.int("prevIndex")?,
            dir: fields.bool("dir"),
            recursive: fields.bool("recursive"),
        })
    }

    pub fn condition(&self) -> Condition {
        if let Some(prev_value) = &self.prev_value {
            Condition::PrevValue(prev_value.clone())
        } else if let Some(prev_index) = self.prev_index {
            Condition::PrevIndex(prev_index)
        } else {
            Condition::Always
        }
    }
}

#[derive(Debug)]
pub struct PostParams {
    pub value: String,
    pub ttl: Option<i64>,
}

impl PostParams {
    pub fn from_fields(fields: &Fields) -> Result<PostParams, EtcdError> {
        Ok(PostParams {
            value: fields.string("value"),
            ttl: fields.int("ttl")?,
        })
    }
}
