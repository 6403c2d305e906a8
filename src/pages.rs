//! Server rendered HTML pages. The interactive parts call the JSON API from
//! small inline scripts.

const STYLE: &str = r#"<link rel="stylesheet" href="https://cdn.jsdelivr.net/npm/@picocss/pico@2/css/pico.min.css">"#;

/// Escapes a string for safe embedding in HTML.
///
/// Replaces `&`, `<`, `>`, `"`, and `'` with their HTML entity equivalents.
pub fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            _ => out.push(c),
        }
    }
    out
}

fn layout(title: &str, body: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="utf-8">
<meta name="viewport" content="width=device-width, initial-scale=1">
<title>{title} | InstaSave</title>
{STYLE}
</head>
<body>
<header class="container">
<nav>
<ul><li><a href="/"><strong>InstaSave</strong></a></li></ul>
<ul>
<li><a href="/private">My media</a></li>
<li><a href="/help">Help</a></li>
<li><a href="/auth/login" role="button">Connect Instagram</a></li>
</ul>
</nav>
</header>
<main class="container">
{body}
</main>
<footer class="container">
<p><small><a href="/privacy">Privacy</a> &middot; <a href="/terms">Terms</a> &middot; Not affiliated with Instagram or Meta.</small></p>
</footer>
</body>
</html>"#,
        title = escape_html(title),
    )
}

/// Media list renderer shared by the home and the private pages
const RENDER_MEDIA_JS: &str = r#"
function renderMedia(target, items) {
  target.replaceChildren();
  for (const item of items) {
    const article = document.createElement('article');
    if (item.thumbnail) {
      const img = document.createElement('img');
      img.src = item.thumbnail;
      img.alt = item.caption || item.id;
      img.loading = 'lazy';
      article.appendChild(img);
    }
    if (item.caption) {
      const caption = document.createElement('p');
      caption.textContent = item.caption;
      article.appendChild(caption);
    }
    const list = document.createElement('ul');
    for (const option of item.downloadUrls) {
      const li = document.createElement('li');
      const a = document.createElement('a');
      a.href = option.url;
      a.textContent = option.label;
      a.target = '_blank';
      a.rel = 'noopener';
      li.appendChild(a);
      list.appendChild(li);
    }
    article.appendChild(list);
    target.appendChild(article);
  }
}
"#;

pub fn render_home() -> String {
    let body = format!(r#"<hgroup>
<h1>Download Instagram media</h1>
<p>Paste a link to a post, reel or IGTV video.</p>
</hgroup>
<form id="resolve-form">
<fieldset role="group">
<input type="url" id="url" name="url" placeholder="https://www.instagram.com/p/..." required>
<input type="submit" value="Get links">
</fieldset>
</form>
<p id="status" role="status"></p>
<section id="result"></section>
<script>
{RENDER_MEDIA_JS}
const params = new URLSearchParams(window.location.search);
const statusLine = document.getElementById('status');
if (params.get('error')) {{
  statusLine.textContent = params.get('message') || params.get('error');
}}
document.getElementById('resolve-form').addEventListener('submit', async (event) => {{
  event.preventDefault();
  statusLine.textContent = 'Resolving...';
  const response = await fetch('/api/resolve', {{
    method: 'POST',
    headers: {{ 'Content-Type': 'application/json' }},
    body: JSON.stringify({{ url: document.getElementById('url').value }})
  }});
  const json = await response.json();
  if (!json.success) {{
    statusLine.textContent = json.error || 'Failed to resolve the link';
    return;
  }}
  statusLine.textContent = json.message;
  renderMedia(document.getElementById('result'), [json.data]);
}});
</script>"#);
    layout("Instagram downloader", &body)
}

pub fn render_private() -> String {
    let body = format!(r#"<hgroup>
<h1>Your Instagram media</h1>
<p>Media of the connected Instagram account.</p>
</hgroup>
<p id="status" role="status">Loading...</p>
<section id="result"></section>
<button id="refresh" class="secondary">Reload</button>
<script>
{RENDER_MEDIA_JS}
const statusLine = document.getElementById('status');
async function fetchUserMedia() {{
  statusLine.textContent = 'Loading...';
  const response = await fetch('/api/user-media');
  const json = await response.json();
  if (!json.success) {{
    statusLine.innerHTML = '';
    statusLine.append((json.message || json.error) + ' ');
    const link = document.createElement('a');
    link.href = '/auth/login';
    link.textContent = 'Connect Instagram';
    statusLine.appendChild(link);
    return;
  }}
  statusLine.textContent = json.message;
  renderMedia(document.getElementById('result'), json.data);
}}
document.getElementById('refresh').addEventListener('click', fetchUserMedia);
fetchUserMedia();
</script>"#);
    layout("Your media", &body)
}

pub fn render_auth_success(user_id: Option<&str>) -> String {
    let account = user_id
        .map(|id| format!("<p>Connected account: <code>User ID: {}</code></p>", escape_html(id)))
        .unwrap_or_default();
    let body = format!(r#"<article>
<h1>Instagram connected successfully!</h1>
<p>Your Instagram account has been connected to InstaSave. You can now download your own Instagram content.</p>
{account}
<a href="/private" role="button">Browse your Instagram content</a>
<a href="/" role="button" class="secondary">Back to home</a>
<footer><small>The access token is kept in an HttpOnly cookie of this browser only.</small></footer>
</article>"#);
    layout("Connected", &body)
}

pub fn render_help() -> String {
    layout("Help", r#"<h1>Help</h1>
<h2>Which links are supported?</h2>
<ul>
<li><code>https://www.instagram.com/p/&lt;id&gt;/</code> &mdash; posts</li>
<li><code>https://www.instagram.com/reel/&lt;id&gt;/</code> &mdash; reels</li>
<li><code>https://www.instagram.com/tv/&lt;id&gt;/</code> &mdash; IGTV videos</li>
<li><code>https://www.instagram.com/stories/&lt;user&gt;/&lt;id&gt;/</code> &mdash; stories</li>
</ul>
<h2>Can I download private content?</h2>
<p>Only your own. Connect your Instagram account and open <a href="/private">My media</a>.</p>
<h2>Why do I see placeholder pictures?</h2>
<p>The public resolver runs in demo mode unless Instagram API credentials are configured.</p>"#)
}

pub fn render_privacy() -> String {
    layout("Privacy policy", r#"<h1>Privacy policy</h1>
<p>InstaSave does not keep a user database. Links you paste are sent to Instagram only to look up the media.</p>
<p>When you connect your Instagram account the access token is stored in an HttpOnly cookie in your browser. Remove it at any time by clearing the cookies of this site.</p>
<p>Webhook notifications from Instagram are logged for diagnostics and are not shared.</p>"#)
}

pub fn render_terms() -> String {
    layout("Terms of service", r#"<h1>Terms of service</h1>
<p>Download only content you own or have permission to use. Respect the rights of the creators and the Instagram Terms of Use.</p>
<p>The service is provided as is, without any warranty.</p>"#)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_escape_html() {
        assert_eq!(
            escape_html(r#"<script>alert("x&y")</script>"#),
            "&lt;script&gt;alert(&quot;x&amp;y&quot;)&lt;/script&gt;"
        );
        assert_eq!(escape_html("it's"), "it&#x27;s");
    }

    #[test]
    fn test_home_calls_resolve_api() {
        let html = render_home();
        assert!(html.contains("<title>Instagram downloader | InstaSave</title>"));
        assert!(html.contains("fetch('/api/resolve'"));
        assert!(html.contains("/auth/login"));
    }

    #[test]
    fn test_success_page_escapes_user_id() {
        let html = render_auth_success(Some("<b>1</b>"));
        assert!(html.contains("User ID: &lt;b&gt;1&lt;/b&gt;"));
        assert!(!html.contains("<b>1</b>"));
        assert!(!render_auth_success(None).contains("User ID"));
    }

    #[test]
    fn test_private_page_lists_user_media() {
        assert!(render_private().contains("fetch('/api/user-media')"));
    }
}
