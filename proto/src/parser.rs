//! Recursive-descent parser for service declarations.
//!
//! Two passes over the file, matching how the embedding consumes it: the
//! codec's compile pass first (so message descriptors resolve), then a
//! walk of the token stream that recognizes `package`, `service` and
//! `rpc` and skips everything else it legally can.

use crate::codec::ProtoCodec;
use crate::error::ProtoError;
use crate::table::{MethodRecord, MethodTable};
use crate::token::{tokenize, Cursor};

use std::path::Path;

/// Parse a `.proto` file into a method table.
pub fn parse_file<C: ProtoCodec>(
    path: impl AsRef<Path>,
    codec: &C,
) -> Result<MethodTable<C::Descriptor>, ProtoError> {
    let path = path.as_ref();
    let source = std::fs::read_to_string(path).map_err(|source| ProtoError::FileNotFound {
        path: path.to_path_buf(),
        source,
    })?;
    tracing::debug!(path = %path.display(), "parsing proto file");
    parse_source(&source, codec)
}

/// Parse `.proto` source text into a method table.
pub fn parse_source<C: ProtoCodec>(
    source: &str,
    codec: &C,
) -> Result<MethodTable<C::Descriptor>, ProtoError> {
    codec.compile(source)?;

    let mut cursor = Cursor::new(tokenize(source));
    let mut package = String::new();
    let mut table = MethodTable::new();

    while let Some(token) = cursor.next() {
        match token.text.as_str() {
            "syntax" | "option" => skip_statement(&mut cursor),
            "import" => {
                return Err(ProtoError::parse(format!(
                    "import statements are not supported (line {})",
                    token.line
                )));
            }
            // Forward scan only: a later package directive does not
            // retroactively qualify services already parsed.
            "package" => {
                package = cursor
                    .next()
                    .ok_or_else(|| ProtoError::parse("expected package name"))?
                    .text;
                if !cursor.eat(";") {
                    return Err(ProtoError::parse(format!(
                        "expected ';' after package {}",
                        package
                    )));
                }
            }
            "message" | "enum" => {
                let name = cursor
                    .next()
                    .ok_or_else(|| ProtoError::parse(format!("expected {} name", token.text)))?;
                if !cursor.skip_block() {
                    return Err(ProtoError::parse(format!(
                        "unterminated {} {} (line {})",
                        token.text, name.text, name.line
                    )));
                }
            }
            "service" => parse_service(&mut cursor, &package, codec, &mut table)?,
            other => {
                return Err(ProtoError::parse(format!(
                    "unexpected token {} (line {})",
                    other, token.line
                )));
            }
        }
    }

    tracing::debug!(methods = table.len(), package = %package, "method table built");
    Ok(table)
}

fn skip_statement(cursor: &mut Cursor) {
    while let Some(token) = cursor.next() {
        if token.text == ";" {
            return;
        }
    }
}

fn parse_service<C: ProtoCodec>(
    cursor: &mut Cursor,
    package: &str,
    codec: &C,
    table: &mut MethodTable<C::Descriptor>,
) -> Result<(), ProtoError> {
    let service = cursor
        .next()
        .ok_or_else(|| ProtoError::parse("expected service name"))?;
    if !cursor.eat("{") {
        return Err(ProtoError::parse(format!(
            "expected '{{' after service {} (line {})",
            service.text, service.line
        )));
    }

    loop {
        let token = cursor.next().ok_or_else(|| {
            ProtoError::parse(format!("unterminated service {}", service.text))
        })?;
        match token.text.as_str() {
            "}" => return Ok(()),
            "option" => skip_statement(cursor),
            "rpc" => parse_rpc(cursor, package, &service.text, codec, table)?,
            other => {
                return Err(ProtoError::parse(format!(
                    "unexpected token {} in service {} (line {})",
                    other, service.text, token.line
                )));
            }
        }
    }
}

fn parse_rpc<C: ProtoCodec>(
    cursor: &mut Cursor,
    package: &str,
    service: &str,
    codec: &C,
    table: &mut MethodTable<C::Descriptor>,
) -> Result<(), ProtoError> {
    let rpc = cursor
        .next()
        .ok_or_else(|| ProtoError::parse("expected rpc name"))?
        .text;

    let (client_streaming, request_type) = parse_type_group(cursor, &rpc)?;
    if !cursor.eat("returns") {
        return Err(ProtoError::parse_in_rpc("expected 'returns'", rpc));
    }
    let (server_streaming, response_type) = parse_type_group(cursor, &rpc)?;

    // Terminator: plain ';' or an options block.
    if !cursor.eat(";") {
        if !cursor.skip_block() {
            return Err(ProtoError::parse_in_rpc(
                "expected ';' or options block after rpc signature",
                rpc,
            ));
        }
    }

    let request = resolve_type(codec, package, &request_type)?;
    let response = resolve_type(codec, package, &response_type)?;

    let full_path = if package.is_empty() {
        format!("/{}/{}", service, rpc)
    } else {
        format!("/{}.{}/{}", package, service, rpc)
    };

    table.insert(MethodRecord {
        simple_name: rpc,
        full_path,
        request,
        response,
        client_streaming,
        server_streaming,
    })
}

/// Parse `( [stream] Type )`, returning the streaming flag and type name.
fn parse_type_group(cursor: &mut Cursor, rpc: &str) -> Result<(bool, String), ProtoError> {
    if !cursor.eat("(") {
        return Err(ProtoError::parse_in_rpc("expected '('", rpc));
    }
    let streaming = cursor.eat("stream");
    let type_name = cursor
        .next()
        .ok_or_else(|| ProtoError::parse_in_rpc("expected message type", rpc))?;
    if type_name.text == ")" {
        return Err(ProtoError::parse_in_rpc("expected message type", rpc));
    }
    if !cursor.eat(")") {
        return Err(ProtoError::parse_in_rpc(
            format!("expected ')' after type {}", type_name.text),
            rpc,
        ));
    }
    Ok((streaming, type_name.text))
}

fn resolve_type<C: ProtoCodec>(
    codec: &C,
    package: &str,
    type_name: &str,
) -> Result<C::Descriptor, ProtoError> {
    let fq_name = if package.is_empty() {
        type_name.to_string()
    } else {
        format!("{}.{}", package, type_name)
    };
    if let Some(descriptor) = codec.resolve(&fq_name) {
        return Ok(descriptor);
    }
    // Tolerate runtimes that registered types without package
    // qualification; runtimes that guarantee qualified registration never
    // reach this.
    if !package.is_empty() {
        if let Some(descriptor) = codec.resolve(type_name) {
            return Ok(descriptor);
        }
    }
    Err(ProtoError::DescriptorMissing { fq_name })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dynamic::DynamicCodec;

    const GREETER: &str = r#"
        syntax = "proto3";
        package helloworld;

        // The request and reply types.
        message HelloRequest { string name = 1; }
        message HelloReply { string message = 1; }

        service Greeter {
            rpc SayHello (HelloRequest) returns (HelloReply);
        }
    "#;

    #[test]
    fn greeter_parses() {
        let codec = DynamicCodec::new();
        let table = parse_source(GREETER, &codec).unwrap();

        assert_eq!(table.len(), 1);
        let method = table.get("SayHello").unwrap();
        assert_eq!(method.full_path, "/helloworld.Greeter/SayHello");
        assert_eq!(method.request.full_name(), "helloworld.HelloRequest");
        assert_eq!(method.response.full_name(), "helloworld.HelloReply");
        assert!(!method.client_streaming);
        assert!(!method.server_streaming);
        assert!(table.get_by_path("/helloworld.Greeter/SayHello").is_some());
    }

    #[test]
    fn no_package_path_composition() {
        let codec = DynamicCodec::new();
        let table = parse_source(
            "message Ping {} service Echo { rpc Send (Ping) returns (Ping); }",
            &codec,
        )
        .unwrap();
        assert_eq!(table.get("Send").unwrap().full_path, "/Echo/Send");
    }

    #[test]
    fn every_rpc_lands_in_the_table() {
        let codec = DynamicCodec::new();
        let source = r#"
            package p;
            message A { string x = 1; }
            message B { string y = 1; }
            service S1 {
                rpc One (A) returns (B);
                rpc Two (B) returns (A);
            }
            service S2 {
                rpc Three (A) returns (A);
            }
        "#;
        let table = parse_source(source, &codec).unwrap();
        assert_eq!(table.len(), 3);
        for record in table.iter() {
            assert!(record.full_path.starts_with('/'));
            // Exactly one separator after the qualified service segment.
            assert_eq!(record.full_path[1..].matches('/').count(), 1);
        }
        assert_eq!(table.get("Three").unwrap().full_path, "/p.S2/Three");
    }

    #[test]
    fn streaming_flags_surfaced() {
        let codec = DynamicCodec::new();
        let source = r#"
            message M { string x = 1; }
            service S {
                rpc In (stream M) returns (M);
                rpc Out (M) returns (stream M);
                rpc Both (stream M) returns (stream M);
            }
        "#;
        let table = parse_source(source, &codec).unwrap();
        assert!(table.get("In").unwrap().client_streaming);
        assert!(!table.get("In").unwrap().server_streaming);
        assert!(table.get("Out").unwrap().server_streaming);
        assert!(table.get("Both").unwrap().client_streaming && table.get("Both").unwrap().server_streaming);
    }

    #[test]
    fn rpc_options_block_skipped() {
        let codec = DynamicCodec::new();
        let source = r#"
            message M { string x = 1; }
            service S {
                rpc WithOptions (M) returns (M) {
                    option deadline = "10s";
                }
                rpc Plain (M) returns (M);
            }
        "#;
        let table = parse_source(source, &codec).unwrap();
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn simple_name_collision_across_services() {
        let codec = DynamicCodec::new();
        let source = r#"
            message M { string x = 1; }
            service A { rpc Get (M) returns (M); }
            service B { rpc Get (M) returns (M); }
        "#;
        let err = parse_source(source, &codec).unwrap_err();
        match err {
            ProtoError::ParseError { rpc_name, .. } => assert_eq!(rpc_name.as_deref(), Some("Get")),
            other => panic!("expected ParseError, got {:?}", other),
        }
    }

    #[test]
    fn package_after_service_does_not_apply_retroactively() {
        let codec = DynamicCodec::new();
        let source = r#"
            message M { string x = 1; }
            service Early { rpc Get (M) returns (M); }
            package late;
            message N { string y = 1; }
            service Later { rpc Put (N) returns (N); }
        "#;
        let table = parse_source(source, &codec).unwrap();
        assert_eq!(table.get("Get").unwrap().full_path, "/Early/Get");
        assert_eq!(table.get("Put").unwrap().full_path, "/late.Later/Put");
    }

    #[test]
    fn missing_descriptor_reported_with_fq_name() {
        let codec = DynamicCodec::new();
        let source = r#"
            package p;
            message M { string x = 1; }
            service S { rpc Get (Missing) returns (M); }
        "#;
        match parse_source(source, &codec).unwrap_err() {
            ProtoError::DescriptorMissing { fq_name } => assert_eq!(fq_name, "p.Missing"),
            other => panic!("expected DescriptorMissing, got {:?}", other),
        }
    }

    #[test]
    fn malformed_rpc_reports_name() {
        let codec = DynamicCodec::new();
        let source = "message M { string x = 1; } service S { rpc Broken (M) (M); }";
        match parse_source(source, &codec).unwrap_err() {
            ProtoError::ParseError { rpc_name, .. } => {
                assert_eq!(rpc_name.as_deref(), Some("Broken"));
            }
            other => panic!("expected ParseError, got {:?}", other),
        }
    }

    #[test]
    fn imports_rejected() {
        let codec = DynamicCodec::new();
        let err = parse_source("import \"other.proto\";", &codec).unwrap_err();
        assert!(matches!(err, ProtoError::ParseError { .. }));
    }

    #[test]
    fn compile_failure_propagates() {
        let codec = DynamicCodec::new();
        let err = parse_source("message Broken { repeated string x = 1; }", &codec).unwrap_err();
        assert!(matches!(err, ProtoError::CompileFailed(_)));
    }

    #[test]
    fn file_roundtrip_and_missing_file() {
        let codec = DynamicCodec::new();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("greeter.proto");
        std::fs::write(&path, GREETER).unwrap();

        let table = parse_file(&path, &codec).unwrap();
        assert_eq!(table.len(), 1);

        let missing = dir.path().join("nope.proto");
        assert!(matches!(
            parse_file(&missing, &codec).unwrap_err(),
            ProtoError::FileNotFound { .. }
        ));
    }
}
