use common::DropboxConfig;
use mockito::Matcher;
use newsdigest::publisher::dropbox::{upload_all, upload_file, DropboxClient, DropboxEndpoints, UploadMode};

fn config() -> DropboxConfig {
    DropboxConfig {
        app_key: "app-key".into(),
        app_secret: "app-secret".into(),
        refresh_token: "refresh-me".into(),
    }
}

fn endpoints(server: &mockito::ServerGuard) -> DropboxEndpoints {
    DropboxEndpoints {
        oauth: server.url(),
        api: format!("{}/2", server.url()),
        content: format!("{}/2", server.url()),
    }
}

async fn mock_auth(server: &mut mockito::ServerGuard) -> (mockito::Mock, mockito::Mock) {
    let token = server
        .mock("POST", "/oauth2/token")
        .match_body(Matcher::AllOf(vec![
            Matcher::UrlEncoded("grant_type".into(), "refresh_token".into()),
            Matcher::UrlEncoded("refresh_token".into(), "refresh-me".into()),
            Matcher::UrlEncoded("client_id".into(), "app-key".into()),
            Matcher::UrlEncoded("client_secret".into(), "app-secret".into()),
        ]))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"access_token": "access-1", "token_type": "bearer", "expires_in": 14400}"#)
        .create_async()
        .await;

    let account = server
        .mock("POST", "/2/users/get_current_account")
        .match_header("authorization", "Bearer access-1")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"account_id": "dbid:test", "email": "me@example.com"}"#)
        .create_async()
        .await;

    (token, account)
}

#[tokio::test]
async fn connect_refreshes_token_and_checks_account() {
    let mut server = mockito::Server::new_async().await;
    let (token, account) = mock_auth(&mut server).await;

    let connected = DropboxClient::connect_with(&config(), endpoints(&server)).await;

    assert!(connected.is_ok());
    token.assert_async().await;
    account.assert_async().await;
}

#[tokio::test]
async fn rejected_account_check_fails_connect() {
    let mut server = mockito::Server::new_async().await;
    let _token = server
        .mock("POST", "/oauth2/token")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"access_token": "access-1"}"#)
        .create_async()
        .await;
    let _account = server
        .mock("POST", "/2/users/get_current_account")
        .with_status(401)
        .with_body(r#"{"error_summary": "invalid_access_token/"}"#)
        .create_async()
        .await;

    let result = DropboxClient::connect_with(&config(), endpoints(&server)).await;
    let err = match result {
        Ok(_) => panic!("connect should fail"),
        Err(e) => e.to_string(),
    };
    assert!(err.contains("401"));
}

#[tokio::test]
async fn small_file_is_uploaded_in_one_call() {
    let mut server = mockito::Server::new_async().await;
    let _auth = mock_auth(&mut server).await;

    let upload = server
        .mock("POST", "/2/files/upload")
        .match_header("authorization", "Bearer access-1")
        .match_header("content-type", "application/octet-stream")
        // non-ASCII is escaped so the header stays plain ASCII
        .match_header(
            "dropbox-api-arg",
            Matcher::AllOf(vec![
                Matcher::Regex(r#""path":"/AI News \\u62a5\\u544a\.md""#.into()),
                Matcher::Regex(r#""mode":"overwrite""#.into()),
            ]),
        )
        .match_body("# digest")
        .with_status(200)
        .with_body(r#"{"name": "AI News.md"}"#)
        .create_async()
        .await;

    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("AI News 报告.md");
    std::fs::write(&file, "# digest").unwrap();

    let client = DropboxClient::connect_with(&config(), endpoints(&server)).await.unwrap();
    let report = upload_all(&client, &[file.clone()], 1024, 1024).await;

    assert_eq!(report.uploaded, vec![file]);
    assert!(report.failed.is_empty());
    upload.assert_async().await;
}

#[tokio::test]
async fn large_file_goes_through_upload_session() {
    let mut server = mockito::Server::new_async().await;
    let _auth = mock_auth(&mut server).await;

    let start = server
        .mock("POST", "/2/files/upload_session/start")
        .match_body("aaaa")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"session_id": "sess-9"}"#)
        .create_async()
        .await;
    let append = server
        .mock("POST", "/2/files/upload_session/append_v2")
        .match_header(
            "dropbox-api-arg",
            Matcher::AllOf(vec![
                Matcher::Regex(r#""offset":4"#.into()),
                Matcher::Regex(r#""session_id":"sess-9""#.into()),
            ]),
        )
        .match_body("bbbb")
        .with_status(200)
        .with_body("null")
        .create_async()
        .await;
    let finish = server
        .mock("POST", "/2/files/upload_session/finish")
        .match_header(
            "dropbox-api-arg",
            Matcher::AllOf(vec![
                Matcher::Regex(r#""offset":8"#.into()),
                Matcher::Regex(r#""path":"/big.pdf""#.into()),
                Matcher::Regex(r#""mode":"overwrite""#.into()),
            ]),
        )
        .match_body("cc")
        .with_status(200)
        .with_body(r#"{"name": "big.pdf"}"#)
        .create_async()
        .await;

    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("big.pdf");
    std::fs::write(&file, "aaaabbbbcc").unwrap();

    let client = DropboxClient::connect_with(&config(), endpoints(&server)).await.unwrap();
    let mode = upload_file(&client, &file, "/big.pdf", 4, 4).await.unwrap();

    assert_eq!(mode, UploadMode::Chunked);
    start.assert_async().await;
    append.assert_async().await;
    finish.assert_async().await;
}

#[tokio::test]
async fn failed_upload_does_not_stop_other_files() {
    let mut server = mockito::Server::new_async().await;
    let _auth = mock_auth(&mut server).await;

    let _rejected = server
        .mock("POST", "/2/files/upload")
        .match_header("dropbox-api-arg", Matcher::Regex("/first.md".into()))
        .with_status(409)
        .with_body(r#"{"error_summary": "path/insufficient_space/"}"#)
        .create_async()
        .await;
    let accepted = server
        .mock("POST", "/2/files/upload")
        .match_header("dropbox-api-arg", Matcher::Regex("/second.md".into()))
        .with_status(200)
        .with_body("{}")
        .create_async()
        .await;

    let dir = tempfile::tempdir().unwrap();
    let first = dir.path().join("first.md");
    let second = dir.path().join("second.md");
    std::fs::write(&first, "1").unwrap();
    std::fs::write(&second, "2").unwrap();

    let client = DropboxClient::connect_with(&config(), endpoints(&server)).await.unwrap();
    let report = upload_all(&client, &[first.clone(), second.clone()], 1024, 1024).await;

    assert_eq!(report.failed, vec![first]);
    assert_eq!(report.uploaded, vec![second]);
    accepted.assert_async().await;
}
