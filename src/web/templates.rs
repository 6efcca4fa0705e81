use chrono::{Datelike, Utc};

const PAGE_BASE_STYLES: &str = r#"
        :root { color-scheme: light; }
        body { font-family: "Helvetica Neue", Arial, sans-serif; margin: 0; background: #f8fafc; color: #0f172a; min-height: 100vh; display: flex; flex-direction: column; }
        header { background: #ffffff; padding: 1.75rem clamp(1.5rem, 6vw, 3rem); border-bottom: 1px solid #e2e8f0; display: flex; justify-content: space-between; align-items: center; flex-wrap: wrap; gap: 1rem; }
        header h1 { margin: 0; font-size: clamp(1.6rem, 3vw, 2.1rem); }
        .identity { display: flex; align-items: center; gap: 0.85rem; color: #475569; }
        .identity img { width: 36px; height: 36px; border-radius: 999px; }
        .logout-form button { padding: 0.55rem 1.2rem; border: none; border-radius: 999px; background: #2563eb; color: #ffffff; font-weight: 600; cursor: pointer; }
        .logout-form button:hover { background: #1d4ed8; }
        main { flex: 1; padding: clamp(1.5rem, 5vw, 3rem); max-width: 1100px; margin: 0 auto; width: 100%; box-sizing: border-box; }
        .panel { background: #ffffff; border-radius: 14px; border: 1px solid #e2e8f0; padding: 1.5rem; box-shadow: 0 18px 40px rgba(15, 23, 42, 0.08); margin-bottom: 2rem; }
        .panel h2 { margin-top: 0; }
        .upload-form { display: flex; flex-wrap: wrap; gap: 1rem; align-items: center; }
        .upload-form button { padding: 0.75rem 1.2rem; border: none; border-radius: 8px; background: #2563eb; color: #ffffff; font-weight: 600; cursor: pointer; }
        .upload-form button:disabled { opacity: 0.6; cursor: not-allowed; }
        .note { color: #64748b; font-size: 0.9rem; }
        .gallery { display: grid; gap: 1.25rem; grid-template-columns: repeat(auto-fill, minmax(200px, 1fr)); }
        .image-card { border: 1px solid #e2e8f0; border-radius: 12px; overflow: hidden; background: #ffffff; display: flex; flex-direction: column; }
        .image-card .thumb { aspect-ratio: 1 / 1; background: #f1f5f9; display: flex; align-items: center; justify-content: center; color: #94a3b8; font-size: 0.85rem; }
        .image-card .thumb img { width: 100%; height: 100%; object-fit: cover; }
        .image-card .meta { padding: 0.75rem; display: flex; flex-direction: column; gap: 0.4rem; font-size: 0.88rem; word-break: break-all; }
        .image-card .actions { display: flex; gap: 0.75rem; }
        .image-card .actions a { color: #2563eb; text-decoration: none; font-weight: 600; }
        .image-card .actions button { border: none; background: none; color: #b91c1c; font-weight: 600; cursor: pointer; padding: 0; }
        .flash { padding: 1rem 1.25rem; border-radius: 10px; margin-bottom: 1.5rem; font-weight: 600; border: 1px solid transparent; }
        .flash.success { background: #ecfdf3; border-color: #bbf7d0; color: #166534; }
        .flash.error { background: #fef2f2; border-color: #fecaca; color: #b91c1c; }
        .toasts { position: fixed; right: 1.25rem; bottom: 1.25rem; display: flex; flex-direction: column; gap: 0.6rem; z-index: 10; }
        .toast { background: #0f172a; color: #f8fafc; padding: 0.75rem 1rem; border-radius: 10px; box-shadow: 0 12px 30px rgba(15, 23, 42, 0.25); font-size: 0.9rem; }
        .toast.warning { background: #92400e; }
        .app-footer { margin: 3rem 0 1.5rem; text-align: center; font-size: 0.85rem; color: #94a3b8; }
"#;

const DASHBOARD_SCRIPT: &str = include_str!("dashboard_client.js");

/// Signed-in view. Image data is fetched by the page script from `/api/images`.
pub fn render_dashboard_page(
    display_name: &str,
    avatar_url: Option<&str>,
    flash_html: &str,
) -> String {
    let avatar = avatar_url
        .map(|url| {
            format!(
                r#"<img src="{}" alt="" referrerpolicy="no-referrer">"#,
                escape_html(url)
            )
        })
        .unwrap_or_default();
    let footer = render_footer();

    format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="UTF-8">
    <title>Photo Dashboard</title>
    <meta name="viewport" content="width=device-width, initial-scale=1">
    <meta name="robots" content="noindex,nofollow">
    <style>
{styles}
    </style>
</head>
<body>
    <header>
        <h1>Photo Dashboard</h1>
        <div class="identity">
            {avatar}
            <span>Signed in as <strong>{name}</strong></span>
            <form class="logout-form" method="post" action="/logout">
                <button type="submit">Sign out</button>
            </form>
        </div>
    </header>
    <main>
        {flash_html}
        <section class="panel">
            <h2>Upload images</h2>
            <form id="upload-form" class="upload-form" enctype="multipart/form-data">
                <input id="upload-input" type="file" name="image" accept=".jpg,.jpeg,.png,.gif,.webp" multiple required>
                <button type="submit">Upload</button>
            </form>
            <p class="note">JPEG, PNG, GIF or WebP. Thumbnails appear automatically once processed.</p>
            <div id="upload-status" class="note"></div>
        </section>
        <section class="panel">
            <h2>Your images</h2>
            <div id="gallery" class="gallery"><p class="note">Loading…</p></div>
        </section>
        {footer}
    </main>
    <div id="toasts" class="toasts"></div>
    <script>
{script}
    </script>
</body>
</html>"#,
        styles = PAGE_BASE_STYLES,
        avatar = avatar,
        name = escape_html(display_name),
        flash_html = flash_html,
        footer = footer,
        script = DASHBOARD_SCRIPT,
    )
}

pub fn render_login_page(flash_html: &str) -> String {
    let footer = render_footer();
    format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="UTF-8">
    <title>Photo Dashboard</title>
    <meta name="viewport" content="width=device-width, initial-scale=1">
    <meta name="robots" content="noindex,nofollow">
    <style>
        :root {{ color-scheme: light; }}
        body {{ font-family: "Helvetica Neue", Arial, sans-serif; display: flex; flex-direction: column; align-items: center; justify-content: center; min-height: 100vh; margin: 0; background: #f1f5f9; color: #0f172a; padding: 1.5rem; box-sizing: border-box; }}
        main {{ width: 100%; max-width: 440px; display: flex; flex-direction: column; align-items: center; gap: 1.5rem; }}
        .panel {{ background: #ffffff; padding: 2.5rem 2.25rem; border-radius: 18px; box-shadow: 0 20px 60px rgba(15, 23, 42, 0.08); width: 100%; border: 1px solid #e2e8f0; box-sizing: border-box; text-align: center; }}
        h1 {{ margin: 0 0 1rem; font-size: 1.8rem; }}
        p.description {{ margin: 0 0 1.75rem; color: #475569; font-size: 0.95rem; }}
        .google-button {{ display: inline-block; width: 100%; padding: 0.95rem; border-radius: 10px; background: #2563eb; color: #ffffff; font-weight: 600; font-size: 1.05rem; text-decoration: none; box-sizing: border-box; }}
        .google-button:hover {{ background: #1d4ed8; }}
        .flash {{ padding: 0.85rem 1rem; border-radius: 10px; margin-bottom: 1.25rem; font-weight: 600; border: 1px solid transparent; }}
        .flash.success {{ background: #ecfdf3; border-color: #bbf7d0; color: #166534; }}
        .flash.error {{ background: #fef2f2; border-color: #fecaca; color: #b91c1c; }}
        .app-footer {{ margin-top: 2.5rem; text-align: center; font-size: 0.85rem; color: #64748b; }}
    </style>
</head>
<body>
    <main>
        <section class="panel">
            <h1>Photo Dashboard</h1>
            {flash_html}
            <p class="description">Sign in to upload images and watch their thumbnails arrive.</p>
            <a class="google-button" href="/auth/google">Sign in with Google</a>
        </section>
        {footer}
    </main>
</body>
</html>"#,
        flash_html = flash_html,
        footer = footer,
    )
}

pub fn render_footer() -> String {
    let current_year = Utc::now().year();
    format!(r#"<footer class="app-footer">© {current_year} Photo Dashboard</footer>"#)
}

pub fn escape_html(input: &str) -> String {
    input
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#39;")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escape_html_neutralizes_markup() {
        assert_eq!(
            escape_html(r#"<a href="x">Tom & 'Jerry'</a>"#),
            "&lt;a href=&quot;x&quot;&gt;Tom &amp; &#39;Jerry&#39;&lt;/a&gt;"
        );
    }

    #[test]
    fn dashboard_escapes_profile_fields() {
        let page = render_dashboard_page("<b>Eve</b>", Some("https://img/\"x"), "");
        assert!(page.contains("&lt;b&gt;Eve&lt;/b&gt;"));
        assert!(page.contains("https://img/&quot;x"));
        assert!(!page.contains("<b>Eve</b>"));
    }

    #[test]
    fn login_page_links_to_google() {
        let page = render_login_page("");
        assert!(page.contains(r#"href="/auth/google""#));
    }
}
