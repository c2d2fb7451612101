use std::collections::BTreeMap;
use std::io::{BufRead, BufReader, Write};
use std::net::TcpListener;
use std::path::Path;
use std::sync::Arc;

use flate2::Compression;
use flate2::write::GzEncoder;
use sha2::{Digest, Sha256};

use kiln::Error;
use kiln::cache::{MANIFEST_FILE, PackageCache, PackageManifest};
use kiln::modules::util;
use kiln::recipe::{Dependency, PackageInfo, PackageType};
use kiln::remote::{HttpRemote, Remote};
use kiln::resolver::{Resolver, TieBreak};
use kiln::version::VersionConstraint;

/// Serve `routes` over HTTP/1.1 on a loopback port until the test exits.
fn serve(routes: BTreeMap<String, Vec<u8>>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let routes = Arc::new(routes);
    std::thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(mut stream) = stream else {
                continue;
            };
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            let mut request_line = String::new();
            if reader.read_line(&mut request_line).is_err() {
                continue;
            }
            loop {
                let mut header = String::new();
                match reader.read_line(&mut header) {
                    Ok(0) | Err(_) => break,
                    Ok(_) if header == "\r\n" => break,
                    Ok(_) => {}
                }
            }
            let path = request_line.split_whitespace().nth(1).unwrap_or("/");
            let (status, body) = match routes.get(path) {
                Some(body) => ("200 OK", body.clone()),
                None => ("404 Not Found", b"not found".to_vec()),
            };
            let head = format!(
                "HTTP/1.1 {status}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                body.len()
            );
            let _ = stream.write_all(head.as_bytes());
            let _ = stream.write_all(&body);
        }
    });
    format!("http://{addr}")
}

/// A `.tar.gz` of a zlib package plus its revision.
fn zlib_archive(version: &str) -> (Vec<u8>, String) {
    let dir = tempfile::tempdir().unwrap();
    util::write_text(&dir.path().join("include/zlib.h"), "#define ZLIB_VERSION 1\n").unwrap();
    util::write_text(&dir.path().join("lib/libz.a"), "archive\n").unwrap();
    let files = util::tree_digests(dir.path(), &[MANIFEST_FILE]).unwrap();
    let revision = PackageManifest::revision_for(&files);
    PackageManifest {
        name: "zlib".into(),
        version: version.into(),
        revision: revision.clone(),
        package_type: PackageType::Library,
        settings: BTreeMap::new(),
        cpp_info: PackageInfo {
            libs: vec!["z".into()],
            ..Default::default()
        },
        files,
    }
    .write(dir.path())
    .unwrap();

    let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
    builder.append_dir_all(".", dir.path()).unwrap();
    let bytes = builder.into_inner().unwrap().finish().unwrap();
    (bytes, revision)
}

fn index(entries: &[(&str, &str, &str, &str)]) -> Vec<u8> {
    let packages: Vec<serde_json::Value> = entries
        .iter()
        .map(|(version, revision, archive, sha256)| {
            serde_json::json!({
                "version": version,
                "revision": revision,
                "archive": archive,
                "sha256": sha256,
            })
        })
        .collect();
    serde_json::to_vec(&serde_json::json!({ "packages": packages })).unwrap()
}

fn zlib(constraint: &str) -> Dependency {
    Dependency {
        name: "zlib".into(),
        constraint: VersionConstraint::parse(constraint).unwrap(),
    }
}

fn remotes(base: &str) -> Vec<Box<dyn Remote>> {
    vec![Box::new(HttpRemote::new("corp", base, None).unwrap())]
}

fn open_cache(root: &Path) -> PackageCache {
    PackageCache::open(root).unwrap()
}

#[test]
fn http_remote_downloads_and_verifies_packages() {
    let (archive, revision) = zlib_archive("1.3.1");
    let sha = hex::encode(Sha256::digest(&archive));
    let mut routes = BTreeMap::new();
    routes.insert(
        "/v1/zlib/index.json".to_string(),
        index(&[
            ("1.2.13", "0000", "pkgs/zlib-old.tar.gz", "00"),
            ("1.3.1", revision.as_str(), "pkgs/zlib-1.3.1.tar.gz", sha.as_str()),
        ]),
    );
    routes.insert("/pkgs/zlib-1.3.1.tar.gz".to_string(), archive);
    let base = serve(routes);

    let remote = HttpRemote::new("corp", &base, None).unwrap();
    let found = remote.query("zlib", &zlib("[>=1.3 <2.0]").constraint).unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].version, "1.3.1");
    assert!(found[0].locator.ends_with("/pkgs/zlib-1.3.1.tar.gz"));

    let tmp = tempfile::tempdir().unwrap();
    let cache = open_cache(&tmp.path().join("cache"));
    let remotes = remotes(&base);
    let resolver = Resolver::new(&cache, &remotes, TieBreak::HighestVersion, false);
    let dep = resolver.resolve(&zlib("1.3.1")).unwrap();
    assert_eq!(dep.revision, revision);
    assert_eq!(dep.origin, "corp");
    assert_eq!(dep.cpp_info.libs, ["z"]);
    assert!(dep.path.join("include/zlib.h").is_file());
    assert_eq!(dep.path, cache.package_dir("zlib", "1.3.1", &revision));
}

#[test]
fn checksum_mismatch_is_rejected_and_nothing_is_cached() {
    let (archive, revision) = zlib_archive("1.3.1");
    let wrong = hex::encode(Sha256::digest(b"something else"));
    let mut routes = BTreeMap::new();
    routes.insert(
        "/v1/zlib/index.json".to_string(),
        index(&[("1.3.1", revision.as_str(), "zlib.tar.gz", wrong.as_str())]),
    );
    routes.insert("/zlib.tar.gz".to_string(), archive);
    let base = serve(routes);

    let tmp = tempfile::tempdir().unwrap();
    let cache = open_cache(&tmp.path().join("cache"));
    let remotes = remotes(&base);
    let resolver = Resolver::new(&cache, &remotes, TieBreak::HighestVersion, false);
    let err = resolver.resolve(&zlib("1.3.1")).unwrap_err();
    assert!(err.to_string().contains("sha256 mismatch"), "unexpected err: {err}");
    assert!(cache.get("zlib", "1.3.1", &revision).unwrap().is_none());
}

#[test]
fn unknown_package_is_not_found() {
    let base = serve(BTreeMap::new());
    let remote = HttpRemote::new("corp", &base, None).unwrap();
    assert!(remote.query("zlib", &zlib("*").constraint).unwrap().is_empty());

    let tmp = tempfile::tempdir().unwrap();
    let cache = open_cache(&tmp.path().join("cache"));
    let remotes = remotes(&base);
    let resolver = Resolver::new(&cache, &remotes, TieBreak::HighestVersion, false);
    let err = resolver.resolve(&zlib("*")).unwrap_err();
    assert!(
        matches!(err, Error::UnresolvedDependency { ref name, .. } if name == "zlib"),
        "unexpected err: {err}"
    );
}
