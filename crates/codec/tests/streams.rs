#![forbid(unsafe_code)]

use k8s_openapi::api::core::v1::{ConfigMap, Namespace, Pod, Secret};
use k8s_openapi::ByteString;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::core::DynamicObject;
use kubeguard_codec::{parse_dynamic, parse_objects, parse_registered, serialize_to_string, CodecError};
use kubeguard_core::{Object, RegistryError, Scheme, TypedObject};

const TWO_DOCS: &str = "\
---
apiVersion: v1
kind: Namespace
metadata:
  name: some-name
  labels:
    name: some-name
---
apiVersion: v1
kind: Pod
metadata:
  name: pod-name
  namespace: pod-namespace
";

fn meta(name: &str, ns: Option<&str>) -> ObjectMeta {
    ObjectMeta { name: Some(name.into()), namespace: ns.map(Into::into), ..Default::default() }
}

fn kinds(objs: &[Object]) -> Vec<String> {
    objs.iter().map(|o| o.types().unwrap().kind).collect()
}

#[test]
fn two_documents_parse_in_order() {
    let objs = parse_objects(TWO_DOCS.as_bytes(), &Scheme::with_builtins(), None).unwrap();
    assert_eq!(kinds(&objs), vec!["Namespace", "Pod"]);
    assert_eq!(objs[0].name(), Some("some-name"));
    assert_eq!(objs[0].meta().labels.as_ref().unwrap()["name"], "some-name");
    assert_eq!(objs[1].name(), Some("pod-name"));
    assert_eq!(objs[1].namespace(), Some("pod-namespace"));
    assert!(objs.iter().all(Object::is_dynamic));
}

#[test]
fn registered_parse_yields_typed_objects() {
    let objs = parse_registered(TWO_DOCS.as_bytes(), &Scheme::with_builtins()).unwrap();
    let ns = objs[0].as_typed().unwrap().downcast_ref::<Namespace>().unwrap();
    assert_eq!(ns.metadata.name.as_deref(), Some("some-name"));
    let pod = objs[1].as_typed().unwrap().downcast_ref::<Pod>().unwrap();
    assert_eq!(pod.metadata.namespace.as_deref(), Some("pod-namespace"));
}

#[test]
fn typed_prototype_shapes_every_document() {
    let scheme = Scheme::with_builtins();
    let proto = Object::Typed(TypedObject::new(Pod::default()));
    let input = "metadata:\n  name: a\n---\nmetadata:\n  name: b\n";
    let objs = parse_objects(input.as_bytes(), &scheme, Some(&proto)).unwrap();
    assert_eq!(objs.len(), 2);
    for (obj, name) in objs.iter().zip(["a", "b"]) {
        let pod = obj.as_typed().unwrap().downcast_ref::<Pod>().unwrap();
        assert_eq!(pod.metadata.name.as_deref(), Some(name));
    }
    // the prototype itself is untouched
    assert_eq!(proto.name(), None);
}

#[test]
fn dynamic_prototype_yields_dynamic_objects() {
    let proto = Object::Dynamic(DynamicObject::new("x", &kube::core::ApiResource::erase::<Pod>(&())));
    let objs = parse_objects(TWO_DOCS.as_bytes(), &Scheme::new(), Some(&proto)).unwrap();
    assert!(objs.iter().all(Object::is_dynamic));
}

#[test]
fn delimiters_and_comments_alone_parse_to_nothing() {
    let input = "---\n\n# just a comment\n---\n   \n---\n# a/b.yaml\n# more\n---\n";
    let objs = parse_objects(input.as_bytes(), &Scheme::with_builtins(), None).unwrap();
    assert!(objs.is_empty());
    assert!(parse_dynamic("".as_bytes()).unwrap().is_empty());
}

#[test]
fn malformed_document_reports_its_exact_bytes() {
    let bad = "apiVersion: v1\nkind: Pod\nmetadata: [unclosed\n";
    let input = format!("{TWO_DOCS}---\n{bad}---\napiVersion: v1\nkind: Namespace\n");
    match parse_objects(input.as_bytes(), &Scheme::with_builtins(), None) {
        Err(CodecError::Parse(e)) => {
            assert_eq!(e.data, bad.as_bytes());
            assert!(matches!(e.source, RegistryError::Yaml(_)), "{}", e.source);
            assert!(e.to_string().starts_with("error parsing data apiVersion: v1"), "{e}");
        }
        other => panic!("expected parse error, got {other:?}"),
    }
}

#[test]
fn headerless_document_fails_dynamic_parse() {
    let e = parse_dynamic("metadata:\n  name: a\n".as_bytes()).unwrap_err();
    assert!(matches!(e, CodecError::Parse(ref p) if matches!(p.source, RegistryError::MissingApiVersion)), "{e}");
}

#[test]
fn parse_dynamic_returns_plain_dynamic_objects() {
    let objs = parse_dynamic(TWO_DOCS.as_bytes()).unwrap();
    assert_eq!(objs.len(), 2);
    assert_eq!(objs[1].types.as_ref().unwrap().kind, "Pod");
}

#[test]
fn mixed_objects_serialize_and_reparse() {
    let scheme = Scheme::with_builtins();
    let secret: DynamicObject = serde_json::from_value(serde_json::json!({
        "apiVersion": "v1",
        "kind": "Secret",
        "metadata": { "name": "creds", "namespace": "ns" },
        "data": { "token": "c2VjcmV0" }
    }))
    .unwrap();
    let objs = vec![
        Object::typed(Namespace { metadata: meta("ns", None), ..Default::default() }),
        Object::typed(ConfigMap { metadata: meta("cm", Some("ns")), ..Default::default() }),
        Object::Dynamic(secret),
    ];

    let out = serialize_to_string(&scheme, &objs).unwrap();
    assert_eq!(out.matches("---\n").count(), 2, "{out}");
    assert!(out.starts_with("apiVersion: v1\nkind: Namespace\n"), "{out}");

    let back = parse_dynamic(out.as_bytes()).unwrap();
    let summary: Vec<_> = back
        .iter()
        .map(|d| (d.types.as_ref().unwrap().kind.as_str(), d.metadata.name.as_deref().unwrap()))
        .collect();
    assert_eq!(summary, vec![("Namespace", "ns"), ("ConfigMap", "cm"), ("Secret", "creds")]);
}

#[test]
fn typed_round_trip_is_stable() {
    let scheme = Scheme::with_builtins();
    let objs = vec![
        Object::typed(Namespace { metadata: meta("a", None), ..Default::default() }),
        Object::typed(ConfigMap {
            metadata: meta("cm", Some("a")),
            data: Some([("k".to_string(), "v".to_string())].into()),
            ..Default::default()
        }),
    ];
    let first = serialize_to_string(&scheme, &objs).unwrap();
    let parsed = parse_registered(first.as_bytes(), &scheme).unwrap();
    assert_eq!(parsed, objs);
    assert_eq!(serialize_to_string(&scheme, &parsed).unwrap(), first);
}

#[test]
fn strict_serialization_rejects_unknown_fields() {
    let scheme = Scheme::with_builtins();
    let objs = parse_dynamic("apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: cm\nspec:\n  x: 1\n".as_bytes()).unwrap();
    let e = serialize_to_string(&scheme, &kubeguard_codec::to_client_objects(objs)).unwrap_err();
    assert!(matches!(e, CodecError::Encode(RegistryError::Strict { .. })), "{e}");
}

#[test]
fn typed_objects_serialize_metadata_before_payload() {
    let scheme = Scheme::with_builtins();
    let objs = vec![
        Object::typed(ConfigMap {
            metadata: meta("cm", Some("ns")),
            data: Some([("k".to_string(), "v".to_string())].into()),
            ..Default::default()
        }),
        Object::typed(Secret {
            metadata: meta("creds", Some("ns")),
            data: Some([("token".to_string(), ByteString(b"secret".to_vec()))].into()),
            type_: Some("Opaque".into()),
            ..Default::default()
        }),
    ];
    let out = serialize_to_string(&scheme, &objs).unwrap();
    assert_eq!(
        out,
        "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: cm\n  namespace: ns\ndata:\n  k: v\n\
         ---\n\
         apiVersion: v1\nkind: Secret\nmetadata:\n  name: creds\n  namespace: ns\ndata:\n  token: c2VjcmV0\ntype: Opaque\n"
    );
}

#[test]
fn commented_delimiter_separates_documents() {
    let input = "apiVersion: v1\nkind: Namespace\nmetadata:\n  name: a\n--- # second\napiVersion: v1\nkind: Namespace\nmetadata:\n  name: b\n";
    let objs = parse_objects(input.as_bytes(), &Scheme::with_builtins(), None).unwrap();
    assert_eq!(kinds(&objs), vec!["Namespace", "Namespace"]);
    assert_eq!(objs.iter().map(|o| o.name().unwrap()).collect::<Vec<_>>(), vec!["a", "b"]);
}
