mod test_support;

use serde_json::json;
use test_support::{request_err, request_ok, spawn_sidecar, temp_dir};

#[test]
fn setup_sections_have_defaults_and_persist_patches() {
    let workspace = temp_dir("examd-setup-defaults");
    {
        let (_child, mut stdin, mut reader) = spawn_sidecar();
        request_ok(
            &mut stdin,
            &mut reader,
            "1",
            "workspace.select",
            json!({ "path": workspace.to_string_lossy() }),
        );

        let setup = request_ok(&mut stdin, &mut reader, "2", "setup.get", json!({}));
        assert_eq!(setup["leaderboard"]["topCount"], json!(3));
        assert_eq!(setup["exams"]["pageSize"], json!(10));
        assert_eq!(setup["reports"]["title"], json!("Student Statistics Report"));
        assert_eq!(setup["reports"]["termHeaderSuffix"], json!(" (Total)"));
        assert_eq!(setup["reports"]["averageDecimals"], json!(2));

        let updated = request_ok(
            &mut stdin,
            &mut reader,
            "3",
            "setup.update",
            json!({ "section": "exams", "patch": { "pageSize": 25 } }),
        );
        assert_eq!(updated["exams"]["pageSize"], json!(25));

        for (id, params) in [
            ("4", json!({ "section": "exams", "patch": { "pageSize": 0 } })),
            ("5", json!({ "section": "leaderboard", "patch": { "topCount": "3" } })),
            ("6", json!({ "section": "reports", "patch": { "colour": "red" } })),
            ("7", json!({ "section": "reports", "patch": { "title": "  " } })),
            ("8", json!({ "section": "grading", "patch": {} })),
        ] {
            assert_eq!(
                request_err(&mut stdin, &mut reader, id, "setup.update", params),
                "bad_params"
            );
        }
    }

    // A fresh process sees the stored patch.
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let setup = request_ok(&mut stdin, &mut reader, "2", "setup.get", json!({}));
    assert_eq!(setup["exams"]["pageSize"], json!(25));
    assert_eq!(setup["leaderboard"]["topCount"], json!(3));
}
