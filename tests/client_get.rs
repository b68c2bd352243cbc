use futures_util::AsyncWriteExt;
use hpool_h1::{Body, Error};

mod common;

#[async_std::test]
async fn client_get_200_ok() -> Result<(), Error> {
    let server = common::serve(|head, mut tcp, _| async move {
        assert!(head.starts_with("GET /path HTTP/1.1\r\nhost: 127.0.0.1:"));

        let res = b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nOK";
        tcp.write_all(res).await?;

        Ok((tcp, false))
    })
    .await?;

    let client = common::client();
    let req = http::Request::get(server.uri("/path")).body(Body::Empty)?;

    let (parts, body) = common::run(&client, req).await?;

    assert_eq!(parts.status, 200);
    assert_eq!(body, b"OK");

    // fully drained keep-alive connection goes back to the pool.
    assert_eq!(client.pool().idle_count(&server.key()), 1);

    Ok(())
}

#[async_std::test]
async fn client_get_chunked_with_trailer() -> Result<(), Error> {
    let server = common::serve(|_, mut tcp, _| async move {
        let res = b"HTTP/1.1 200 OK\r\ntransfer-encoding: chunked\r\n\r\n\
            5\r\nhello\r\n6\r\n world\r\n0\r\nx-checksum: abc\r\n\r\n";
        tcp.write_all(res).await?;

        Ok((tcp, false))
    })
    .await?;

    let client = common::client();
    let req = http::Request::get(server.uri("/")).body(Body::Empty)?;

    let cancel = hpool_h1::Cancel::new();
    let res = client.send(req, &cancel).await?;

    let (parts, mut body) = res.into_parts();
    assert_eq!(parts.status, 200);

    let v = body.read_to_vec().await?;
    assert_eq!(v, b"hello world");

    // trailer was consumed and captured before the body reported its end.
    let trailers = body.trailers().expect("trailers after chunked body");
    assert_eq!(trailers.get("x-checksum").unwrap(), "abc");

    assert_eq!(client.pool().idle_count(&server.key()), 1);

    Ok(())
}

#[async_std::test]
async fn client_get_gzip() -> Result<(), Error> {
    use flate2::write::GzEncoder;
    use std::io::Write;

    let mut enc = GzEncoder::new(vec![], flate2::Compression::default());
    enc.write_all(b"hello gzip world").unwrap();
    let compressed = enc.finish().unwrap();

    let server = common::serve(move |_, mut tcp, _| {
        let compressed = compressed.clone();
        async move {
            let head = format!(
                "HTTP/1.1 200 OK\r\ncontent-encoding: gzip\r\ncontent-length: {}\r\n\r\n",
                compressed.len()
            );
            tcp.write_all(head.as_bytes()).await?;
            tcp.write_all(&compressed).await?;

            Ok((tcp, false))
        }
    })
    .await?;

    let client = common::client();
    let req = http::Request::get(server.uri("/")).body(Body::Empty)?;

    let (parts, body) = common::run(&client, req).await?;

    assert_eq!(parts.status, 200);
    assert_eq!(body, b"hello gzip world");

    // the fixed-length framing under the decoder completed, so the
    // connection is still good.
    assert_eq!(client.pool().idle_count(&server.key()), 1);

    Ok(())
}

#[async_std::test]
async fn client_get_deflate_chunked() -> Result<(), Error> {
    use flate2::write::ZlibEncoder;
    use std::io::Write;

    let mut enc = ZlibEncoder::new(vec![], flate2::Compression::default());
    enc.write_all(b"deflated body").unwrap();
    let compressed = enc.finish().unwrap();

    let server = common::serve(move |_, mut tcp, _| {
        let compressed = compressed.clone();
        async move {
            // chunked + deflate: decoder outermost, chunked underneath.
            let mut res: Vec<u8> =
                b"HTTP/1.1 200 OK\r\ncontent-encoding: deflate\r\ntransfer-encoding: chunked\r\n\r\n"
                    .to_vec();
            for part in compressed.chunks(5) {
                res.extend_from_slice(format!("{:x}\r\n", part.len()).as_bytes());
                res.extend_from_slice(part);
                res.extend_from_slice(b"\r\n");
            }
            res.extend_from_slice(b"0\r\n\r\n");
            tcp.write_all(&res).await?;

            Ok((tcp, false))
        }
    })
    .await?;

    let client = common::client();
    let req = http::Request::get(server.uri("/")).body(Body::Empty)?;

    let (parts, body) = common::run(&client, req).await?;

    assert_eq!(parts.status, 200);
    assert_eq!(body, b"deflated body");

    assert_eq!(client.pool().idle_count(&server.key()), 1);

    Ok(())
}

#[async_std::test]
async fn client_head_no_body() -> Result<(), Error> {
    let server = common::serve(|head, mut tcp, _| async move {
        assert!(head.starts_with("HEAD / HTTP/1.1\r\n"));

        // content-length describes what GET would return; HEAD sends none.
        let res = b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\n";
        tcp.write_all(res).await?;

        Ok((tcp, false))
    })
    .await?;

    let client = common::client();
    let req = http::Request::head(server.uri("/")).body(Body::Empty)?;

    let (parts, body) = common::run(&client, req).await?;

    assert_eq!(parts.status, 200);
    assert!(body.is_empty());

    assert_eq!(client.pool().idle_count(&server.key()), 1);

    Ok(())
}

#[async_std::test]
async fn client_post_body() -> Result<(), Error> {
    let server = common::serve(|head, mut tcp, _| async move {
        assert!(head.contains("content-length: 5\r\n"));

        let got = common::read_body(&mut tcp, 5).await?;
        assert_eq!(got, b"HELLO");

        let res = b"HTTP/1.1 201 Created\r\nContent-Length: 0\r\n\r\n";
        tcp.write_all(res).await?;

        Ok((tcp, false))
    })
    .await?;

    let client = common::client();
    let req = http::Request::post(server.uri("/items")).body(Body::from("HELLO"))?;

    let (parts, body) = common::run(&client, req).await?;

    assert_eq!(parts.status, 201);
    assert!(body.is_empty());

    Ok(())
}

#[async_std::test]
async fn client_post_chunked_body() -> Result<(), Error> {
    let server = common::serve(|head, mut tcp, _| async move {
        assert!(head.contains("transfer-encoding: chunked\r\n"));

        // 5-byte body arrives as one chunk plus the terminator.
        let got = common::read_body(&mut tcp, 5 + 3 + 2 + 5).await?;
        assert_eq!(got, b"5\r\nHELLO\r\n0\r\n\r\n");

        let res = b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n";
        tcp.write_all(res).await?;

        Ok((tcp, false))
    })
    .await?;

    let client = common::client();
    let req = http::Request::post(server.uri("/stream"))
        .header("transfer-encoding", "chunked")
        .body(Body::from("HELLO"))?;

    let (parts, _) = common::run(&client, req).await?;
    assert_eq!(parts.status, 200);

    Ok(())
}
