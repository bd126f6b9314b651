use serde::{Deserialize, Serialize};

/// Identifier of a therapist persona. Small positive integers on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PersonaId(pub u32);

impl PersonaId {
    pub fn as_u32(&self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for PersonaId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Persona every unknown id resolves to.
pub const DEFAULT_PERSONA_ID: PersonaId = PersonaId(1);

/// A fixed therapist character: display name plus the system prompt that
/// defines it for an entire conversation.
#[derive(Debug, Clone, Copy)]
pub struct Persona {
    pub id: PersonaId,
    pub name: &'static str,
    pub system_prompt: &'static str,
}

const PERSONAS: [Persona; 4] = [
    Persona {
        id: PersonaId(1),
        name: "Eccentric German Psychoanalyst",
        system_prompt: "You are an eccentric German psychoanalyst who specializes in helping \
                        crypto degens for whom you have mild contempt for indulging in nihilistic \
                        financial games. Respond in character, with a German accent.",
    },
    Persona {
        id: PersonaId(2),
        name: "Crypto Degen CBT Therapist",
        system_prompt: "You are a CBT therapist but you are a broke crypto degenerate yourself \
                        and you encourage your clients to take crazy risks hoping their behavior \
                        will benefit you. Respond in character.",
    },
    Persona {
        id: PersonaId(3),
        name: "Straight-Laced Judgmental Therapist",
        system_prompt: "You are a qualified therapist but you are very straight laced and can't \
                        help pepper your sensible advice with mild contempt towards your crypto \
                        degen clients, encouraging them to just get married, have kids and work \
                        at the local Burger King. Respond in character.",
    },
    Persona {
        id: PersonaId(4),
        name: "Secret Dog Therapist",
        system_prompt: "You are a qualified therapist but you are secretly a dog and are trying \
                        badly to hide the fact that you are actually a dog. Occasionally let \
                        slip dog-like behaviors or knowledge. Respond in character.",
    },
];

pub fn all() -> &'static [Persona] {
    &PERSONAS
}

pub fn get(id: PersonaId) -> Option<&'static Persona> {
    PERSONAS.iter().find(|persona| persona.id == id)
}

/// Total lookup: unknown ids fall back to the default persona rather than
/// failing. The permissive default is part of the /chat contract.
pub fn resolve(id: PersonaId) -> &'static Persona {
    get(id).unwrap_or(&PERSONAS[0])
}

pub fn system_prompt(id: PersonaId) -> &'static str {
    resolve(id).system_prompt
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_holds_four_personas_with_distinct_ids() {
        assert_eq!(all().len(), 4);
        for (index, persona) in all().iter().enumerate() {
            assert_eq!(persona.id, PersonaId(index as u32 + 1));
            assert!(!persona.system_prompt.is_empty());
        }
    }

    #[test]
    fn unknown_persona_falls_back_to_default_prompt() {
        assert_eq!(
            system_prompt(PersonaId(99)),
            system_prompt(DEFAULT_PERSONA_ID)
        );
        assert_eq!(resolve(PersonaId(99)).id, DEFAULT_PERSONA_ID);
    }

    #[test]
    fn known_persona_resolves_to_its_own_prompt() {
        let dog = resolve(PersonaId(4));
        assert_eq!(dog.name, "Secret Dog Therapist");
        assert!(dog.system_prompt.contains("secretly a dog"));
    }
}
