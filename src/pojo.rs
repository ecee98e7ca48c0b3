//! Demo provider registered by the `highway` binary.
//!
//! Serves microservice `pojo`, schema `codeFirst`.

use highway_protocol::{
    FieldType, Invocation, MessageType, OperationId, OperationSchema, SchemaRegistry, Value,
};
use highway_server::{ServiceError, ServiceRegistry};

const MICROSERVICE: &str = "pojo";
const SCHEMA_ID: &str = "codeFirst";

fn operation(name: &str) -> OperationId {
    OperationId::new(MICROSERVICE, SCHEMA_ID, name)
}

fn string_arg<'a>(inv: &'a Invocation, name: &str) -> &'a str {
    inv.argument(name).and_then(Value::as_str).unwrap_or_default()
}

fn int_arg(inv: &Invocation, name: &str) -> Result<i32, ServiceError> {
    let value = inv.argument(name).and_then(Value::as_i64).unwrap_or_default();
    i32::try_from(value).map_err(|_| ServiceError::consumer_fault(format!("{name} out of range")))
}

/// Registers the demo operations' schemas and handlers.
pub fn register(schemas: &SchemaRegistry, services: &ServiceRegistry) {
    let person = MessageType::new("Person").field("name", FieldType::String);

    schemas.register(
        OperationSchema::builder(operation("sayHi"))
            .param("name", FieldType::String)
            .returns(FieldType::String)
            .build(),
    );
    services.register(operation("sayHi"), |inv: &mut Invocation| {
        Ok(Some(Value::from(format!("{} sayhi", string_arg(inv, "name")))))
    });

    schemas.register(
        OperationSchema::builder(operation("reduce"))
            .param("a", FieldType::int32())
            .param("b", FieldType::int32())
            .returns(FieldType::int32())
            .build(),
    );
    services.register(operation("reduce"), |inv: &mut Invocation| {
        let a = int_arg(inv, "a")?;
        let b = int_arg(inv, "b")?;
        Ok(Some(Value::Int32(a.wrapping_sub(b))))
    });

    schemas.register(
        OperationSchema::builder(operation("isTrue"))
            .returns(FieldType::bool())
            .build(),
    );
    services.register(operation("isTrue"), |_: &mut Invocation| {
        Ok(Some(Value::Bool(true)))
    });

    schemas.register(
        OperationSchema::builder(operation("sayHello"))
            .param("person", FieldType::message(person))
            .returns(FieldType::String)
            .build(),
    );
    services.register(operation("sayHello"), |inv: &mut Invocation| {
        let name = inv
            .argument("person")
            .and_then(Value::as_message)
            .and_then(|fields| fields.get("name"))
            .and_then(Value::as_str)
            .unwrap_or_default();
        Ok(Some(Value::from(format!("hello person {name}"))))
    });

    tracing::debug!(operations = services.len(), "registered demo provider");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn call(name: &str, inv: Invocation) -> Result<Option<Value>, ServiceError> {
        let schemas = SchemaRegistry::new();
        let services = ServiceRegistry::new();
        register(&schemas, &services);
        assert!(schemas.lookup(&operation(name)).is_ok());
        let handler = services.get(&operation(name)).unwrap();
        let mut inv = inv;
        handler(&mut inv)
    }

    #[test]
    fn test_say_hi() {
        let inv = Invocation::new(operation("sayHi")).with_argument("name", "world");
        assert_eq!(call("sayHi", inv), Ok(Some(Value::from("world sayhi"))));
    }

    #[test]
    fn test_reduce() {
        let inv = Invocation::new(operation("reduce"))
            .with_argument("a", 5)
            .with_argument("b", 3);
        assert_eq!(call("reduce", inv), Ok(Some(Value::Int32(2))));
    }

    #[test]
    fn test_reduce_out_of_range() {
        let inv = Invocation::new(operation("reduce")).with_argument("a", i64::MAX);
        let err = call("reduce", inv).unwrap_err();
        assert_eq!(err.status, highway_protocol::status::CONSUMER_FAULT);
    }

    #[test]
    fn test_say_hello() {
        let person = BTreeMap::from([("name".to_string(), Value::from("p"))]);
        let inv = Invocation::new(operation("sayHello"))
            .with_argument("person", Value::Message(person));
        assert_eq!(call("sayHello", inv), Ok(Some(Value::from("hello person p"))));
    }

    #[test]
    fn test_is_true() {
        let inv = Invocation::new(operation("isTrue"));
        assert_eq!(call("isTrue", inv), Ok(Some(Value::Bool(true))));
    }
}
