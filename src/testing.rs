//! Project fixtures shared by the pipeline, broker and dev session tests.

use std::fs;
use std::path::Path;

use tempfile::TempDir;

pub(crate) use crate::bundler::testing::FakeBundler;

pub(crate) fn write(root: &Path, rel: &str, content: &str) {
    let path = root.join(rel);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, content).unwrap();
}

/// MV3 extension: worker background, one content script on
/// `*://example.com/*`, a popup page and an icon.
///
/// ```text
/// src/background.ts ──▶ src/format.ts
/// src/content.ts ──▶ src/util.ts
/// src/popup.ts ──▶ src/view.ts ──▶ src/format.ts
///                └─▶ src/setup.ts (side effects)
/// ```
///
/// Hot handlers: content.ts accepts util.ts, popup.ts accepts view.ts and
/// format.ts, background.ts accepts format.ts.
pub(crate) fn extension_project() -> TempDir {
    let dir = TempDir::new().unwrap();
    let root = dir.path();

    write(
        root,
        "manifest.json",
        r#"{
  "manifest_version": 3,
  "name": "Highlighter",
  "version": "1.0.0",
  "background": { "service_worker": "src/background.ts" },
  "content_scripts": [
    { "matches": ["*://example.com/*"], "js": ["src/content.ts"], "css": ["src/content.css"] }
  ],
  "action": { "default_popup": "popup.html" },
  "icons": { "48": "icons/48.png" },
  "permissions": ["storage"]
}"#,
    );
    write(
        root,
        "src/background.ts",
        "import { format } from './format';\nimport.meta.hot?.accept('src/format.ts', () => {});\nchrome.runtime.onInstalled.addListener(() => console.log(format('installed')));\n",
    );
    write(
        root,
        "src/content.ts",
        "import { highlight } from './util';\nimport.meta.hot?.accept('src/util.ts', (next) => next.highlight(document.body));\nhighlight(document.body);\n",
    );
    write(root, "src/content.css", ".crx-mark { color: red; }\n");
    write(
        root,
        "src/util.ts",
        "export function highlight(el) {\n  el.classList.add('crx-mark');\n}\n",
    );
    write(
        root,
        "popup.html",
        r#"<html><body><div id="app"></div><script src="./src/popup.ts"></script></body></html>"#,
    );
    write(
        root,
        "src/popup.ts",
        "import { render } from './view';\nimport './setup';\nimport.meta.hot?.accept('src/view.ts', (next) => next.render());\nimport.meta.hot?.accept('src/format.ts', () => render());\nrender();\n",
    );
    write(
        root,
        "src/view.ts",
        "import { format } from './format';\nexport const render = () => format('hi');\n",
    );
    write(root, "src/format.ts", "export const format = (s) => `<${s}>`;\n");
    write(root, "src/setup.ts", "document.title = 'Popup';\n");
    write(root, "icons/48.png", "png-bytes");
    write(root, "public/_locales/en/messages.json", "{}");

    dir
}
