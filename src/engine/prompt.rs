// Copyright (c) 2024-2026, Daily
// SPDX-License-Identifier: BSD-2-Clause

//! System prompt rendering.
//!
//! Voice prompts differ from text-chat prompts: responses must be short,
//! naturally phrased, and free of any formatting, because everything the
//! model produces is spoken.

use crate::tenant::TenantSnapshot;

/// Render the per-tenant system prompt from the snapshot's template
/// variables.
pub fn render_system_prompt(tenant: &TenantSnapshot) -> String {
    format!(
        "You are the AI receptionist for {name} ({industry}).\n\
         Tone: {tone}. Language: {language}. Be warm and concise (1-2 sentences).\n\
         \n\
         BUSINESS CONTEXT:\n\
         - Services: {services}\n\
         - Hours: {hours}\n\
         - Policies: {policies}\n\
         - FAQs: {faqs}\n\
         \n\
         TOOLS POLICY:\n\
         - Use tools only for lookups the caller explicitly asks about.\n\
         - Booking lookups use the caller's phone; never ask for a tenant id.\n\
         \n\
         VOICE CONVERSATION RULES:\n\
         - Keep responses SHORT: 1-2 sentences, 15-25 words max.\n\
         - Sound natural and warm, like a friendly human.\n\
         - Never use bullet points, lists, or formatted text.\n\
         - Do NOT say goodbye unless the caller's request is fully resolved.\n\
         - Do NOT claim a booking is confirmed before all details are collected.\n\
         \n\
         If unsure about anything, say \"Let me check on that for you\" and keep it brief.",
        name = tenant.display_name,
        industry = tenant.industry,
        tone = tenant.tone,
        language = tenant.language,
        services = tenant.services_summary,
        hours = tenant.working_hours_summary,
        policies = tenant.policies_summary,
        faqs = tenant.faqs_summary,
    )
}
