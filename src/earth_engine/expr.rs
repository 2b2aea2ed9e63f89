//! Earth Engine expression graphs, as accepted by the REST `value:compute` and
//! `image:export` endpoints.
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;

/// Name given to the argument of mapped functions
pub const MAPPING_VAR: &str = "_MAPPING_VAR_0_0";

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Constant(Value),
    Call {
        function: String,
        args: BTreeMap<String, Expr>,
    },
    Argument(String),
    Function {
        params: Vec<String>,
        body: Box<Expr>,
    },
}

impl Expr {
    pub fn constant(value: impl Into<Value>) -> Self {
        Self::Constant(value.into())
    }

    pub fn call<'a>(function: &str, args: impl IntoIterator<Item = (&'a str, Expr)>) -> Self {
        Self::Call {
            function: function.to_string(),
            args: args
                .into_iter()
                .map(|(name, arg)| (name.to_string(), arg))
                .collect(),
        }
    }

    /// A one-argument function whose body is built from the argument reference.
    pub fn lambda(body: impl FnOnce(Expr) -> Expr) -> Self {
        Self::Function {
            params: vec![MAPPING_VAR.to_string()],
            body: Box::new(body(Self::Argument(MAPPING_VAR.to_string()))),
        }
    }

    pub fn function_name(self: &Self) -> Option<&str> {
        match self {
            Self::Call { function, .. } => Some(function.as_str()),
            _ => None,
        }
    }

    pub fn arg(self: &Self, name: &str) -> Option<&Expr> {
        match self {
            Self::Call { args, .. } => args.get(name),
            _ => None,
        }
    }

    pub fn as_constant(self: &Self) -> Option<&Value> {
        match self {
            Self::Constant(value) => Some(value),
            _ => None,
        }
    }

    /// Serializes into `{"result": key, "values": {...}}`. Function bodies are stored
    /// in the value table and referenced by key, everything else is inlined.
    pub fn encode(self: &Self) -> Value {
        let mut encoder = Encoder { values: Map::new() };
        let root = encoder.node(self);
        let result = encoder.intern(root);
        json!({ "result": result, "values": encoder.values })
    }
}

struct Encoder {
    values: Map<String, Value>,
}

impl Encoder {
    fn intern(&mut self, node: Value) -> String {
        let key = self.values.len().to_string();
        self.values.insert(key.clone(), node);
        key
    }

    fn node(&mut self, expr: &Expr) -> Value {
        match expr {
            Expr::Constant(value) => json!({ "constantValue": value }),
            Expr::Argument(name) => json!({ "argumentReference": name }),
            Expr::Call { function, args } => {
                let mut arguments = Map::new();
                for (name, arg) in args {
                    let node = self.node(arg);
                    arguments.insert(name.clone(), node);
                }
                json!({
                    "functionInvocationValue": {
                        "functionName": function,
                        "arguments": arguments,
                    }
                })
            }
            Expr::Function { params, body } => {
                let body = self.node(body);
                let key = self.intern(body);
                json!({
                    "functionDefinitionValue": {
                        "argumentNames": params,
                        "body": key,
                    }
                })
            }
        }
    }
}
