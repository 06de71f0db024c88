use axum::extract::State;
use axum::response::Html;
use bytes::Bytes;

use super::AppState;

const INDEX_TEMPLATE: &str = r#"<!DOCTYPE html>
<html>
<head>
<meta charset="utf-8">
<title>framecast</title>
<style>
body { font-family: sans-serif; background: #111; color: #ddd; margin: 2em; }
#feed { display: block; border: 1px solid #444; }
#detections { margin-top: 1em; font-family: monospace; white-space: pre; }
</style>
</head>
<body>
<h1>framecast</h1>
<img id="feed" src="/video_feed" width="{{width}}" height="{{height}}" alt="live stream">
{{panel}}
</body>
</html>
"#;

const DETECTION_PANEL: &str = r#"<div id="detections">waiting for detections</div>
<script>
const panel = document.getElementById("detections");
async function refresh() {
  try {
    const response = await fetch("/detections");
    const detections = await response.json();
    panel.textContent = detections.length === 0
      ? "no detections"
      : detections
          .map(d => `${d.class_name} ${(d.confidence * 100).toFixed(1)}% at (${Math.round(d.center_x)}, ${Math.round(d.center_y)})`)
          .join("\n");
  } catch (err) {
    panel.textContent = "detections unavailable";
  }
}
setInterval(refresh, 100);
</script>"#;

/// Viewer page with the stream sized to the capture resolution. The
/// detection panel polls `/detections` every 100 ms.
pub fn render_index(width: u32, height: u32, detections: bool) -> String {
    INDEX_TEMPLATE
        .replace("{{width}}", &width.to_string())
        .replace("{{height}}", &height.to_string())
        .replace("{{panel}}", if detections { DETECTION_PANEL } else { "" })
}

pub(super) async fn index(State(state): State<AppState>) -> Html<Bytes> {
    Html(state.page.clone())
}
