//! The per-field input to a resolver expression.

use crate::value::DynamicValue;
use crate::value::Object;

/// Everything a resolver can template against:
/// `{value, args, parent, headers, vars}`. Created per field invocation and
/// dropped when the field completes.
#[derive(Clone, Debug, Default)]
pub struct Context {
    /// The parent field's resolved value.
    pub value: DynamicValue,
    /// The current field's arguments, defaults applied.
    pub args: Object,
    /// The parent context, materialized, so templates can reach
    /// grand-parents via `{{parent.value.x}}`.
    pub parent: Option<Box<Context>>,
    /// Allow-listed inbound request headers.
    pub headers: Object,
    /// Server-level static variables.
    pub vars: Object,
}

impl Context {
    /// Materializes the context as the dynamic value handed to the
    /// expression interpreter.
    pub fn to_value(&self) -> DynamicValue {
        let mut object = Object::with_capacity(5);
        object.insert("value".to_string(), self.value.clone());
        object.insert("args".to_string(), DynamicValue::Object(self.args.clone()));
        object.insert(
            "parent".to_string(),
            self.parent
                .as_ref()
                .map(|parent| parent.to_value())
                .unwrap_or_default(),
        );
        object.insert(
            "headers".to_string(),
            DynamicValue::Object(self.headers.clone()),
        );
        object.insert("vars".to_string(), DynamicValue::Object(self.vars.clone()));
        DynamicValue::Object(object)
    }

    /// The context for a child field: the child's value and args, with
    /// this context as parent. Headers and vars carry over.
    pub fn child(&self, value: DynamicValue, args: Object) -> Context {
        Context {
            value,
            args,
            parent: Some(Box::new(self.clone())),
            headers: self.headers.clone(),
            vars: self.vars.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dynamic;

    #[test]
    fn materializes_all_five_members() {
        let ctx = Context {
            value: dynamic!({"id": 1}),
            args: [("sort".to_string(), DynamicValue::from("asc"))]
                .into_iter()
                .collect(),
            parent: None,
            headers: [("authorization".to_string(), DynamicValue::from("1"))]
                .into_iter()
                .collect(),
            vars: Object::default(),
        };
        let value = ctx.to_value();
        assert_eq!(value.get_path(&["value", "id"]), Some(&DynamicValue::Int(1)));
        assert_eq!(
            value.get_path(&["args", "sort"]),
            Some(&DynamicValue::from("asc"))
        );
        assert_eq!(
            value.get_path(&["headers", "authorization"]),
            Some(&DynamicValue::from("1"))
        );
        assert_eq!(value.get_path(&["parent"]), Some(&DynamicValue::Null));
    }

    #[test]
    fn child_contexts_chain_to_grandparents() {
        let root = Context {
            value: dynamic!({"id": 7}),
            ..Default::default()
        };
        let child = root.child(dynamic!({"id": 8}), Object::default());
        let grandchild = child.child(dynamic!({"id": 9}), Object::default());
        let value = grandchild.to_value();
        assert_eq!(
            value.get_path(&["parent", "parent", "value", "id"]),
            Some(&DynamicValue::Int(7))
        );
    }
}
