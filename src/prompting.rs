use minijinja::{context, Environment};

const SYSTEM_PROMPT_TEMPLATE: &str = include_str!("prompts/system_prompt.j2");

pub struct FallbackPromptContext<'a> {
    pub bot_name: &'a str,
}

/// System preamble for the stateless chat-completion fallback. The persistent
/// assistant carries its own instructions; this only covers the degraded path.
pub fn render_fallback_system_prompt(ctx: &FallbackPromptContext<'_>) -> String {
    let mut env = Environment::new();
    if env
        .add_template("system_prompt", SYSTEM_PROMPT_TEMPLATE)
        .is_err()
    {
        return fallback_system_prompt(ctx);
    }

    let Ok(template) = env.get_template("system_prompt") else {
        return fallback_system_prompt(ctx);
    };

    template
        .render(context! {
            bot_name => if ctx.bot_name.trim().is_empty() { "Luna" } else { ctx.bot_name.trim() },
        })
        .unwrap_or_else(|_| fallback_system_prompt(ctx))
}

fn fallback_system_prompt(ctx: &FallbackPromptContext<'_>) -> String {
    let bot_name = if ctx.bot_name.trim().is_empty() {
        "Luna"
    } else {
        ctx.bot_name.trim()
    };
    format!(
        "Você é a {bot_name}, assistente virtual de atendimento no WhatsApp.\n\
         Responda sempre em PT-BR, de forma direta e simpática.\n\
         Nunca invente informações; se não souber, diga que vai verificar."
    )
}
